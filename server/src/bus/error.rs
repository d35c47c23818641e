//! Bus error types

use thiserror::Error;

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool has been closed; no further leases are handed out
    #[error("connection pool is closed")]
    Closed,
    /// Opening a new connection failed
    #[error("failed to open connection: {0}")]
    Connect(String),
}

/// Error type for bus operations
#[derive(Debug, Error)]
pub enum BusError {
    /// Connection-level failure (backend unreachable, pool exhausted fatally)
    #[error("connection error: {0}")]
    Connection(String),
    /// Stream operation failed
    #[error("stream error: {0}")]
    Stream(String),
    /// Consumer group creation or lookup failed
    #[error("consumer group error: {0}")]
    ConsumerGroup(String),
    /// Acknowledgment failed; the message remains pending
    #[error("ack failed: {0}")]
    Ack(String),
    /// Payload or header encoding failed
    #[error("encode error: {0}")]
    Encode(String),
    /// Payload decoding failed
    #[error("decode error: {0}")]
    Decode(String),
    /// Caller misuse (missing required header, unknown topic)
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl From<deadpool_redis::PoolError> for BusError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        BusError::Connection(err.to_string())
    }
}

impl From<deadpool_redis::redis::RedisError> for BusError {
    fn from(err: deadpool_redis::redis::RedisError) -> Self {
        BusError::Stream(err.to_string())
    }
}
