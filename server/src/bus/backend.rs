//! Stream-store backend trait
//!
//! The bus is written against this trait with two implementations: Redis
//! Streams for distributed deployments and an in-process store for
//! single-process runs and tests. Command-style operations (append, range,
//! ack, group management) are one round-trip calls; blocking reads go
//! through a [`StreamReader`], a leased handle owning whatever dedicated
//! resources the backend needs to park in a read.

use std::time::Duration;

use async_trait::async_trait;

use super::envelope::RawEntry;
use super::error::BusError;

/// Read position for fetches and new subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offset {
    /// The start of the topic's retained history
    Begin,
    /// Only entries appended after this point
    Now,
    /// Resume immediately after the entry the cursor names
    Cursor(String),
}

/// Start position for a one-shot range read
#[derive(Debug, Clone)]
pub enum RangeStart {
    Begin,
    /// Exclusive: entries strictly after this id
    After(String),
}

/// Stream statistics for monitoring
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Total entries currently retained in the stream
    pub length: u64,
    /// Entries delivered to the group but not yet acked
    pub pending: u64,
    /// Consumers with pending entries in the group
    pub consumers: u64,
}

/// Stream store operations
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Append an entry; returns its id. `max_len` is an approximate
    /// retention hint trimming older entries.
    async fn append(
        &self,
        topic: &str,
        fields: &[(&str, Vec<u8>)],
        max_len: Option<u64>,
    ) -> Result<String, BusError>;

    /// One-shot ordered read of up to `limit` entries
    async fn range(
        &self,
        topic: &str,
        start: RangeStart,
        limit: usize,
    ) -> Result<Vec<RawEntry>, BusError>;

    /// Id of the newest entry, `None` for an empty or absent topic
    async fn last_id(&self, topic: &str) -> Result<Option<String>, BusError>;

    /// Create the consumer group if it does not exist. The offset applies
    /// only on first creation; an existing group is left untouched.
    async fn ensure_group(&self, topic: &str, group: &str, offset: &Offset)
    -> Result<(), BusError>;

    /// Acknowledge an entry for a group
    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), BusError>;

    /// Lease a reader for blocking reads
    async fn open_reader(&self) -> Result<Box<dyn StreamReader>, BusError>;

    async fn stats(&self, topic: &str, group: &str) -> Result<StreamStats, BusError>;

    async fn health_check(&self) -> Result<(), BusError>;

    /// Backend name for debugging/logging
    fn backend_name(&self) -> &'static str;
}

/// Leased handle for blocking reads.
///
/// `close` must be called on the normal path; dropping a reader mid-read
/// (an aborted subscription task) releases its resources as unhealthy.
#[async_trait]
pub trait StreamReader: Send {
    /// Read new entries for a consumer group, blocking up to `block`.
    /// Returns an empty vec on timeout.
    async fn read_group(
        &mut self,
        topic: &str,
        group: &str,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> Result<Vec<RawEntry>, BusError>;

    /// Read entries strictly after `after`, blocking up to `block`.
    /// Returns an empty vec on timeout.
    async fn read_tail(
        &mut self,
        topic: &str,
        after: &str,
        block: Duration,
        count: usize,
    ) -> Result<Vec<RawEntry>, BusError>;

    /// Release the reader's resources. `unhealthy` discards the underlying
    /// connection instead of returning it for reuse.
    async fn close(self: Box<Self>, unhealthy: bool);
}
