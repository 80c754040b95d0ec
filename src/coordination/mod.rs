//! Coordination-store client abstraction
//!
//! The token store only needs two things from the distributed key-value
//! store it mirrors: a prefix read for the initial snapshot, and a prefix
//! watch that yields put/delete events afterwards. Backends:
//!
//! - **Memory**: in-process map with live watchers (tests, local development).
//! - **Etcd**: `etcd-client` adapter with TLS and user/password dialing
//!   (behind the `etcd` cargo feature).

#[cfg(feature = "etcd")]
mod etcd;
mod memory;

#[cfg(feature = "etcd")]
pub use etcd::EtcdCoordinator;
pub use memory::MemoryCoordinator;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Failed to connect to coordination store: {0}")]
    Connect(String),
    #[error("Coordination store request failed: {0}")]
    Request(String),
    #[error("TLS configuration error: {0}")]
    Tls(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Coordination store unavailable")]
    Unavailable,
}

/// A single key/value pair as stored under the watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Store revision at which this value was last written
    pub mod_revision: i64,
}

/// Result of a prefix read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub kvs: Vec<KeyValue>,
    /// Store revision the read was served at
    pub revision: i64,
}

/// A change observed on the watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String, revision: i64 },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(kv) => &kv.key,
            WatchEvent::Delete { key, .. } => key,
        }
    }

    /// Store revision at which the change happened.
    pub fn revision(&self) -> i64 {
        match self {
            WatchEvent::Put(kv) => kv.mod_revision,
            WatchEvent::Delete { revision, .. } => *revision,
        }
    }
}

/// Stream of change events. The stream ending means the underlying watch
/// was lost and has to be re-established by the consumer.
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Client for the distributed key-value store holding token records.
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Fetch every key/value under `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, CoordinationError>;

    /// Watch `prefix` starting from the current revision.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, CoordinationError>;
}
