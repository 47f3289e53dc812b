use std::io::Write;

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;

/// Compress only when the payload is big enough for gzip to pay for itself.
pub(crate) const MIN_COMPRESS_BYTES: usize = 1024;

const MAX_POOLED: usize = 16;

/// Shared free-list of reusable gzip output buffers. One buffer is checked
/// out per active compression and returned afterwards; checkout clears any
/// previous contents.
pub(crate) struct GzipWriterPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl GzipWriterPool {
    pub(crate) fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn compress(&self, data: &[u8]) -> Result<PooledGzip<'_>> {
        let mut buffer = self.free.lock().pop().unwrap_or_default();
        buffer.clear();

        let mut encoder = GzEncoder::new(buffer, Compression::default());
        encoder.write_all(data).context("gzip compression failed")?;
        let buffer = encoder.finish().context("gzip finalization failed")?;
        Ok(PooledGzip { pool: self, buffer })
    }

    fn put_back(&self, buffer: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED {
            free.push(buffer);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

/// Compressed bytes borrowed from the pool; the buffer returns to the
/// free-list on drop.
pub(crate) struct PooledGzip<'a> {
    pool: &'a GzipWriterPool,
    buffer: Vec<u8>,
}

impl PooledGzip<'_> {
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl Drop for PooledGzip<'_> {
    fn drop(&mut self) {
        self.pool.put_back(std::mem::take(&mut self.buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn roundtrips_through_gzip() {
        let pool = GzipWriterPool::new();
        let payload = b"x".repeat(4096);
        let compressed = pool.compress(&payload).unwrap();
        assert!(!compressed.bytes().is_empty());
        assert!(compressed.bytes().len() < payload.len());

        let mut decoder = flate2::read::GzDecoder::new(compressed.bytes());
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn buffers_return_to_the_free_list() {
        let pool = GzipWriterPool::new();
        {
            let _compressed = pool.compress(b"some payload worth compressing").unwrap();
            assert_eq!(pool.pooled(), 0);
        }
        assert_eq!(pool.pooled(), 1);

        // The same buffer is reused and holds fresh output.
        let second = pool.compress(b"different payload").unwrap();
        let mut decoder = flate2::read::GzDecoder::new(second.bytes());
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, b"different payload");
    }
}
