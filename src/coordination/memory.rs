//! In-memory coordination store.
//!
//! Keeps a sorted map of keys guarded by a mutex and fans every write out to
//! the live watchers whose prefix matches. Revisions are a single counter
//! bumped on every mutation, like a one-member etcd cluster.
//!
//! The test hooks (`disconnect_watchers`, `set_available`, `set_get_delay`)
//! simulate transport failures so the store's reconnect and timeout paths
//! can be exercised without a real cluster.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use super::{CoordinationClient, CoordinationError, KeyValue, Snapshot, WatchEvent, WatchStream};

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

struct MemoryState {
    available: bool,
    entries: BTreeMap<String, Vec<u8>>,
    get_delay: Option<Duration>,
    revision: i64,
    watchers: Vec<Watcher>,
}

pub struct MemoryCoordinator {
    state: Mutex<MemoryState>,
    watchers_changed: Notify,
}

impl MemoryCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemoryState {
                available: true,
                entries: BTreeMap::new(),
                get_delay: None,
                revision: 0,
                watchers: Vec::new(),
            }),
            watchers_changed: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a raw value and notify watchers. Returns the new revision.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> i64 {
        let key = key.into();
        let value = value.into();
        let mut state = self.lock();
        state.revision += 1;
        let revision = state.revision;
        state.entries.insert(key.clone(), value.clone());

        let event = WatchEvent::Put(KeyValue {
            key,
            value,
            mod_revision: revision,
        });
        broadcast(&mut state.watchers, &event);
        revision
    }

    /// Store `value` serialized as JSON.
    pub fn put_json<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<i64, serde_json::Error> {
        let data = serde_json::to_vec(value)?;
        Ok(self.put(key, data))
    }

    /// Remove a key. Returns false (and emits nothing) if it was absent.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.lock();
        if state.entries.remove(key).is_none() {
            return false;
        }
        state.revision += 1;
        let event = WatchEvent::Delete {
            key: key.to_string(),
            revision: state.revision,
        };
        broadcast(&mut state.watchers, &event);
        true
    }

    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    /// Drop every live watch, ending the consumers' event streams.
    pub fn disconnect_watchers(&self) {
        let dropped = {
            let mut state = self.lock();
            std::mem::take(&mut state.watchers).len()
        };
        debug!(watchers = dropped, "Disconnected memory watchers");
        self.watchers_changed.notify_waiters();
    }

    /// Number of watchers whose stream is still being consumed.
    pub fn watcher_count(&self) -> usize {
        let mut state = self.lock();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    /// Wait until at least `count` watchers are subscribed.
    pub async fn wait_for_watchers(&self, count: usize) {
        loop {
            let notified = self.watchers_changed.notified();
            if self.watcher_count() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Make reads and new watches fail with [`CoordinationError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Delay every prefix read, to exercise snapshot timeouts.
    pub fn set_get_delay(&self, delay: Option<Duration>) {
        self.lock().get_delay = delay;
    }
}

fn broadcast(watchers: &mut Vec<Watcher>, event: &WatchEvent) {
    watchers.retain(|w| {
        if !event.key().starts_with(&w.prefix) {
            return !w.tx.is_closed();
        }
        w.tx.send(event.clone()).is_ok()
    });
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, CoordinationError> {
        let delay = {
            let state = self.lock();
            if !state.available {
                return Err(CoordinationError::Unavailable);
            }
            state.get_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        let kvs = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: value.clone(),
                mod_revision: state.revision,
            })
            .collect();
        Ok(Snapshot {
            kvs,
            revision: state.revision,
        })
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, CoordinationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            if !state.available {
                return Err(CoordinationError::Unavailable);
            }
            state.watchers.push(Watcher {
                prefix: prefix.to_string(),
                tx,
            });
        }
        self.watchers_changed.notify_waiters();

        let events = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(Box::pin(events))
    }
}
