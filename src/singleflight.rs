use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

/// What a coalesced caller observes: the leader's value, the leader's
/// error (shared), or an aborted flight (the leader panicked or its task
/// died before publishing).
#[derive(Debug, Error)]
pub enum FlightError<E: std::error::Error> {
    #[error(transparent)]
    Call(Arc<E>),
    #[error("coalesced upstream call aborted before publishing a result")]
    Aborted,
}

impl<E: std::error::Error> Clone for FlightError<E> {
    fn clone(&self) -> Self {
        match self {
            FlightError::Call(err) => FlightError::Call(Arc::clone(err)),
            FlightError::Aborted => FlightError::Aborted,
        }
    }
}

type FlightSlot<E> = Option<Result<Vec<u8>, FlightError<E>>>;
type FlightTable<E> = Arc<Mutex<HashMap<String, watch::Receiver<FlightSlot<E>>>>>;

/// Collapses concurrent identical miss-fills into one underlying call.
///
/// The first caller for a key installs a record and spawns the call as a
/// detached task, so the leader runs to completion even if the installing
/// connection goes away; every caller (leader included) waits on a watch
/// channel and may cancel independently. The record is removed before the
/// result is published, so later callers start a fresh flight.
pub struct SingleFlight<E: std::error::Error> {
    calls: FlightTable<E>,
}

impl<E> SingleFlight<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run<F>(&self, key: &str, f: F) -> Result<Vec<u8>, FlightError<E>>
    where
        F: Future<Output = Result<Vec<u8>, E>> + Send + 'static,
    {
        let rx = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.to_string(), rx.clone());
                    self.spawn_leader(key.to_string(), tx, f);
                    rx
                }
            }
        };
        wait_for_result(rx).await
    }

    fn spawn_leader<F>(&self, key: String, tx: watch::Sender<FlightSlot<E>>, f: F)
    where
        F: Future<Output = Result<Vec<u8>, E>> + Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        tokio::spawn(async move {
            // The guard removes the record and publishes a failure on every
            // exit path; leaving a record installed would wedge all future
            // callers for this key.
            let mut guard = RecordGuard {
                calls,
                key: key.clone(),
                tx: Some(tx),
            };
            let outcome = match tokio::spawn(f).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(FlightError::Call(Arc::new(err))),
                Err(join_err) => {
                    warn!(key = %key, error = %join_err, "single-flight leader aborted");
                    Err(FlightError::Aborted)
                }
            };
            guard.publish(outcome);
        });
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

impl<E> Default for SingleFlight<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_result<E: std::error::Error>(
    mut rx: watch::Receiver<FlightSlot<E>>,
) -> Result<Vec<u8>, FlightError<E>> {
    loop {
        let published = {
            let slot = rx.borrow_and_update();
            (*slot).clone()
        };
        if let Some(outcome) = published {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return Err(FlightError::Aborted);
        }
    }
}

struct RecordGuard<E: std::error::Error> {
    calls: FlightTable<E>,
    key: String,
    tx: Option<watch::Sender<FlightSlot<E>>>,
}

impl<E: std::error::Error> RecordGuard<E> {
    fn publish(&mut self, outcome: Result<Vec<u8>, FlightError<E>>) {
        self.calls.lock().remove(&self.key);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(outcome));
        }
    }
}

impl<E: std::error::Error> Drop for RecordGuard<E> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.publish(Err(FlightError::Aborted));
        }
    }
}
