//! Value encoding and compression
//!
//! Values are encoded as JSON and optionally zstd-compressed. Both steps are
//! CPU-bound, so the manager runs them on a bounded rayon pool and awaits the
//! result through a oneshot channel instead of blocking a runtime worker.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{error, trace};

/// zstd level used for compressed payloads
const ZSTD_LEVEL: i32 = 3;

/// Encode a value to its stored form: JSON, zstd-framed when `compressed`
pub fn encode(value: &Value, compressed: bool) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    if !compressed {
        return Ok(json);
    }

    let framed = zstd::bulk::compress(&json, ZSTD_LEVEL)
        .map_err(|e| Error::SerializationFailure(format!("Failed to compress payload: {}", e)))?;
    trace!(json = json.len(), framed = framed.len(), "Compressed payload");
    Ok(framed)
}

/// Decode a stored payload back into a value
pub fn decode(bytes: &[u8], compressed: bool) -> Result<Value> {
    let parsed = if compressed {
        let json = zstd::decode_all(bytes)
            .map_err(|e| Error::Storage(format!("Failed to decompress payload: {}", e)))?;
        serde_json::from_slice(&json)
    } else {
        serde_json::from_slice(bytes)
    };
    parsed.map_err(|e| Error::Storage(format!("Failed to decode stored payload: {}", e)))
}

/// Bounded worker pool for encode/decode
pub struct CodecPool {
    pool: rayon::ThreadPool,
}

impl CodecPool {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("recalldb-codec-{}", i))
            .panic_handler(|_| error!("Codec worker panicked"))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build codec pool: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Encode on the pool
    pub async fn encode(&self, value: Value, compressed: bool) -> Result<Vec<u8>> {
        self.run(move || encode(&value, compressed)).await
    }

    /// Build the JSON tree and encode it, both on the pool.
    ///
    /// Returns the tree (for the cache) alongside the stored bytes.
    pub async fn serialize<T>(&self, value: T, compressed: bool) -> Result<(Value, Vec<u8>)>
    where
        T: Serialize + Send + 'static,
    {
        self.run(move || {
            let value = serde_json::to_value(&value)?;
            let bytes = encode(&value, compressed)?;
            Ok((value, bytes))
        })
        .await
    }

    /// Decode on the pool
    pub async fn decode(&self, bytes: Vec<u8>, compressed: bool) -> Result<Value> {
        self.run(move || decode(&bytes, compressed)).await
    }

    async fn run<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            // Receiver may be gone if the caller was cancelled
            let _ = tx.send(job());
        });
        rx.await
            .map_err(|_| Error::Internal("Codec worker dropped the job".to_string()))?
    }
}
