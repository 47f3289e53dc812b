#![allow(dead_code)]

mod config;
mod harness;
mod proxy_client;
mod upstream;

pub use config::*;
pub use harness::*;
pub use proxy_client::*;
pub use upstream::*;
