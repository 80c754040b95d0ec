//! Shared test helpers for `#[cfg(test)]` modules in the crate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::DEFAULT_PREFIX;
use crate::coordination::MemoryCoordinator;
use crate::tokens::{InvalidationCallback, StoreOptions, TokenRecord, TokenStore};

/// How long async assertions wait before giving up
const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// A record with the given token, region and enabled flag.
pub fn make_record(token: &str, region: &str, enabled: bool) -> TokenRecord {
    TokenRecord {
        token: token.to_string(),
        region: region.to_string(),
        enabled,
        ..Default::default()
    }
}

/// Coordination-store key for `token` under the default prefix.
pub fn token_key(token: &str) -> String {
    format!("{DEFAULT_PREFIX}{token}")
}

pub fn put_record(coordinator: &MemoryCoordinator, record: &TokenRecord) {
    coordinator
        .put_json(token_key(&record.token), record)
        .unwrap();
}

/// Store options with a short reconnect backoff.
pub fn test_options(region: &str) -> StoreOptions {
    StoreOptions {
        reconnect_backoff: Duration::from_millis(20),
        snapshot_timeout: Duration::from_secs(1),
        ..StoreOptions::new(region)
    }
}

/// Start a store over `coordinator` with [`test_options`].
pub async fn start_store(coordinator: &Arc<MemoryCoordinator>, region: &str) -> TokenStore {
    TokenStore::start(coordinator.clone(), test_options(region))
        .await
        .unwrap()
}

/// Callback that forwards every invalidated token into a channel.
pub fn channel_callback() -> (InvalidationCallback, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: InvalidationCallback = Arc::new(move |token: String| {
        let _ = tx.send(token);
    });
    (callback, rx)
}

/// Callback that appends every invalidated token to a shared list.
pub fn recording_callback() -> (InvalidationCallback, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: InvalidationCallback = Arc::new(move |token: String| {
        sink.lock().unwrap().push(token);
    });
    (callback, seen)
}

/// Next invalidated token, or `None` if nothing arrives in time.
pub async fn recv_invalidation(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
    tokio::time::timeout(WAIT_TIMEOUT, rx.recv())
        .await
        .ok()
        .flatten()
}

/// Poll `condition` until it holds. Returns false on timeout.
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
