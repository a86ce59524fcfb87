//! Stream backends.
//!
//! The bus talks to its backend through [`StreamTransport`] and
//! [`GroupReader`]. The production backend is Redis Streams
//! ([`redis::RedisTransport`]); [`memory::MemoryTransport`] mirrors the same
//! consumer-group semantics in process for tests and embedded runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

pub mod memory;
pub mod redis;

/// One entry read from a stream: the transport-assigned id plus the flat
/// field map exactly as stored.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Shape of one stream for introspection surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub exists: bool,
    pub length: u64,
    pub first_entry: Option<String>,
    pub last_entry: Option<String>,
    pub group_count: u64,
}

impl StreamInfo {
    pub(crate) fn missing() -> Self {
        Self {
            exists: false,
            length: 0,
            first_entry: None,
            last_entry: None,
            group_count: 0,
        }
    }
}

/// Backend contract the bus relies on.
///
/// Appends cap the stream approximately at `maxlen` by evicting oldest
/// entries. Consumer groups are created at stream origin and creation is
/// idempotent. Delivery is at-least-once: an entry stays pending for its
/// group until acknowledged.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Append a field map, returning the assigned entry id.
    async fn append(
        &self,
        stream: &str,
        maxlen: usize,
        fields: &HashMap<String, String>,
    ) -> Result<String>;

    /// Create a consumer group reading from the stream origin. Succeeds
    /// quietly when the group already exists.
    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Open a dedicated reader for one `(stream, group, consumer)` identity.
    /// Readers hold their own connection so a blocking read never stalls
    /// publishes on the shared connection.
    async fn open_reader(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn GroupReader>>;

    /// Oldest-first slice of the stream, at most `count` entries.
    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>>;

    /// Shape of a stream; a never-written stream reports `exists: false`.
    async fn stream_info(&self, stream: &str) -> Result<StreamInfo>;

    /// Liveness probe against the backend.
    async fn ping(&self) -> Result<()>;
}

/// Read side of one consumer identity within a group.
#[async_trait]
pub trait GroupReader: Send {
    /// Read up to `count` never-delivered entries, waiting up to `block`
    /// for at least one to arrive.
    async fn read_new(&mut self, count: usize, block: Duration) -> Result<Vec<StreamEntry>>;

    /// Take over entries that have been pending anywhere in the group for
    /// at least `min_idle`, making this consumer their new owner.
    async fn claim_stale(&mut self, min_idle: Duration, count: usize) -> Result<Vec<StreamEntry>>;

    /// Acknowledge one entry, removing it from the group's pending set.
    async fn ack(&mut self, entry_id: &str) -> Result<()>;
}
