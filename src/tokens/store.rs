//! Token store: snapshot load, background watch loop, read accessors.
//!
//! The store mirrors every token record under a coordination-store prefix
//! into a local cache. Construction loads a full snapshot; a background task
//! then applies put/delete events as they arrive. When the event stream is
//! lost the loop waits a fixed backoff and re-subscribes from the current
//! revision. Events that happened during the gap are not replayed unless
//! `resync_on_reconnect` is set, in which case the snapshot is reloaded
//! right after re-subscribing.
//!
//! Snapshot installs and event application are serialized through one async
//! lock that also records the revision of the last installed snapshot.
//! Events at or below that revision are already reflected and are skipped,
//! so a reload racing the watch loop can never roll a token back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::TokenCache;
use super::dispatch::{InvalidationCallback, InvalidationDispatcher};
use super::record::{redact, TokenError, TokenRecord};
use crate::config::{ConfigError, StoreConfig, DEFAULT_PREFIX};
use crate::coordination::{CoordinationClient, CoordinationError, WatchEvent, WatchStream};

/// Cache writer lock, holding the revision of the last installed snapshot.
type SnapshotFloor = Arc<AsyncMutex<i64>>;

/// Upper bound on the initial (and any reload) prefix read
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between losing the watch stream and re-subscribing
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Coordination store error: {0}")]
    Coordination(#[from] CoordinationError),
    #[error("Snapshot load timed out after {0:?}")]
    SnapshotTimeout(Duration),
    #[error("Token store is closed")]
    Closed,
}

/// Runtime options of a token store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub prefix: String,
    pub reconnect_backoff: Duration,
    pub region: String,
    /// Reload the full snapshot after every watch re-subscription
    pub resync_on_reconnect: bool,
    pub snapshot_timeout: Duration,
}

impl StoreOptions {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            reconnect_backoff: RECONNECT_BACKOFF,
            region: region.into(),
            resync_on_reconnect: false,
            snapshot_timeout: SNAPSHOT_TIMEOUT,
        }
    }
}

impl From<&StoreConfig> for StoreOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            prefix: config.prefix.clone(),
            resync_on_reconnect: config.resync_on_reconnect,
            ..Self::new(config.region.clone())
        }
    }
}

/// Live, region-scoped view of the tenant tokens held in the coordination
/// store.
pub struct TokenStore {
    cache: Arc<TokenCache>,
    client: Mutex<Option<Arc<dyn CoordinationClient>>>,
    dispatcher: InvalidationDispatcher,
    floor: SnapshotFloor,
    options: StoreOptions,
    shutdown: CancellationToken,
}

impl TokenStore {
    /// Dial etcd with `config` and start a store on top of it.
    #[cfg(feature = "etcd")]
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let client = crate::coordination::EtcdCoordinator::connect(config).await?;
        Self::start(Arc::new(client), StoreOptions::from(config)).await
    }

    /// Load the initial snapshot through `client` and start the watch loop.
    ///
    /// Fails if the snapshot cannot be read within the snapshot timeout.
    /// Malformed records are logged and skipped.
    pub async fn start(
        client: Arc<dyn CoordinationClient>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        if options.region.is_empty() {
            return Err(ConfigError::ValidationError("region cannot be empty".to_string()).into());
        }

        let snapshot = load_snapshot(client.as_ref(), &options).await?;
        let loaded = snapshot.tokens.len();

        let cache = Arc::new(TokenCache::new(options.region.clone()));
        cache.replace_all(snapshot.tokens);
        let floor = Arc::new(AsyncMutex::new(snapshot.revision));

        let shutdown = CancellationToken::new();
        let dispatcher = InvalidationDispatcher::spawn(shutdown.clone());

        let initial_stream = match client.watch_prefix(&options.prefix).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "Failed to establish token watch, will retry");
                None
            }
        };

        let watch_loop = WatchLoop {
            cache: Arc::clone(&cache),
            client: Arc::clone(&client),
            dispatcher: dispatcher.clone(),
            floor: Arc::clone(&floor),
            options: options.clone(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(watch_loop.run(initial_stream));

        info!(
            region = %options.region,
            prefix = %options.prefix,
            tokens = loaded,
            "Token store started"
        );

        Ok(Self {
            cache,
            client: Mutex::new(Some(client)),
            dispatcher,
            floor,
            options,
            shutdown,
        })
    }

    /// The record for `token`, only if it is enabled and in this region.
    pub fn get_token(&self, token: &str) -> Option<TokenRecord> {
        self.cache.get_valid(token)
    }

    /// Like [`get_token`](Self::get_token) but says why a token is unusable.
    pub fn validate_token(&self, token: &str) -> Result<TokenRecord, TokenError> {
        self.cache.validate(token)
    }

    /// Number of cached records, valid or not.
    pub fn token_count(&self) -> usize {
        self.cache.len()
    }

    pub fn region(&self) -> &str {
        self.cache.region()
    }

    pub fn prefix(&self) -> &str {
        &self.options.prefix
    }

    /// Register the hook fired when a valid token turns invalid or is
    /// deleted. Replaces any previous registration.
    pub fn set_token_invalid_callback(&self, callback: InvalidationCallback) {
        self.cache.set_callback(callback);
    }

    /// Snapshot of every record currently valid for this region.
    pub fn valid_tokens(&self) -> Vec<TokenRecord> {
        self.cache.valid_tokens()
    }

    /// First valid record accepted by `matches`, scanned under the shared
    /// cache lock.
    pub(crate) fn find_valid<F>(&self, matches: F) -> Option<TokenRecord>
    where
        F: FnMut(&TokenRecord) -> bool,
    {
        self.cache.find_valid(matches)
    }

    /// Re-read the full snapshot and replace the cache. Tokens that were
    /// valid and no longer are get reported to the invalidation callback.
    ///
    /// Watch events arriving while the read is in flight are held back and
    /// applied on top of the new snapshot.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StoreError::Closed)?;

        let count = reload_into(
            &self.cache,
            &self.dispatcher,
            &self.floor,
            client.as_ref(),
            &self.options,
        )
        .await?;
        info!(tokens = count, "Token cache reloaded");
        Ok(count)
    }

    /// Stop the watch loop and release the coordination client.
    pub fn close(&self) {
        self.shutdown.cancel();
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if client.is_some() {
            info!(region = %self.region(), "Token store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for TokenStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("region", &self.options.region)
            .field("prefix", &self.options.prefix)
            .field("tokens", &self.cache.len())
            .finish()
    }
}

struct LoadedSnapshot {
    revision: i64,
    tokens: HashMap<String, TokenRecord>,
}

/// Read every record under the prefix, bounded by the snapshot timeout.
async fn load_snapshot(
    client: &dyn CoordinationClient,
    options: &StoreOptions,
) -> Result<LoadedSnapshot, StoreError> {
    let snapshot =
        tokio::time::timeout(options.snapshot_timeout, client.get_prefix(&options.prefix))
            .await
            .map_err(|_| StoreError::SnapshotTimeout(options.snapshot_timeout))??;

    let mut tokens = HashMap::with_capacity(snapshot.kvs.len());
    for kv in snapshot.kvs {
        if let Some(record) = parse_record(&options.prefix, &kv.key, &kv.value) {
            tokens.insert(record.token.clone(), record);
        }
    }
    debug!(tokens = tokens.len(), revision = snapshot.revision, "Token snapshot loaded");
    Ok(LoadedSnapshot {
        revision: snapshot.revision,
        tokens,
    })
}

/// Load and install a snapshot while holding the writer lock.
async fn reload_into(
    cache: &TokenCache,
    dispatcher: &InvalidationDispatcher,
    floor: &AsyncMutex<i64>,
    client: &dyn CoordinationClient,
    options: &StoreOptions,
) -> Result<usize, StoreError> {
    let mut floor = floor.lock().await;
    let snapshot = load_snapshot(client, options).await?;
    let count = snapshot.tokens.len();
    install_snapshot(cache, dispatcher, snapshot.tokens);
    *floor = (*floor).max(snapshot.revision);
    Ok(count)
}

fn install_snapshot(
    cache: &TokenCache,
    dispatcher: &InvalidationDispatcher,
    tokens: HashMap<String, TokenRecord>,
) {
    for invalidation in cache.replace_all(tokens) {
        info!(token = %redact(&invalidation.token), "Token no longer valid after reload");
        dispatcher.dispatch(invalidation);
    }
}

/// Decode a stored value. A record without a `token` field takes the token
/// from its key.
fn parse_record(prefix: &str, key: &str, value: &[u8]) -> Option<TokenRecord> {
    let key_token = key.strip_prefix(prefix).unwrap_or(key);

    let mut record: TokenRecord = match serde_json::from_slice(value) {
        Ok(record) => record,
        Err(e) => {
            warn!(token = %redact(key_token), error = %e, "Failed to parse token record, skipping");
            return None;
        }
    };

    if record.token.is_empty() {
        record.token = key_token.to_string();
    } else if record.token != key_token {
        debug!(
            token = %record.redacted(),
            key_token = %redact(key_token),
            "Token record stored under a different key"
        );
    }

    if record.token.is_empty() {
        warn!("Token record without a token, skipping");
        return None;
    }
    Some(record)
}

/// State owned by the background watch task.
struct WatchLoop {
    cache: Arc<TokenCache>,
    client: Arc<dyn CoordinationClient>,
    dispatcher: InvalidationDispatcher,
    floor: SnapshotFloor,
    options: StoreOptions,
    shutdown: CancellationToken,
}

impl WatchLoop {
    async fn run(self, mut stream: Option<WatchStream>) {
        loop {
            if let Some(events) = stream.take() {
                if !self.consume(events).await {
                    break;
                }
                warn!(prefix = %self.options.prefix, "Token watch stream closed, reconnecting");
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.options.reconnect_backoff) => {}
            }

            stream = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.client.watch_prefix(&self.options.prefix) => match result {
                    Ok(events) => {
                        info!(prefix = %self.options.prefix, "Token watch re-established");
                        Some(events)
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to re-establish token watch");
                        None
                    }
                },
            };

            if stream.is_some() && self.options.resync_on_reconnect {
                self.resync().await;
            }
        }
        debug!("Token watch loop stopped");
    }

    /// Apply events until the stream ends (true) or the store closes (false).
    async fn consume(&self, mut events: WatchStream) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                next = events.next() => match next {
                    Some(event) => self.apply(event).await,
                    None => return true,
                },
            }
        }
    }

    async fn apply(&self, event: WatchEvent) {
        let floor = self.floor.lock().await;
        if event.revision() <= *floor {
            debug!(revision = event.revision(), floor = *floor, "Skipping event covered by snapshot");
            return;
        }

        let invalidation = match event {
            WatchEvent::Put(kv) => {
                let Some(record) = parse_record(&self.options.prefix, &kv.key, &kv.value) else {
                    return;
                };
                debug!(
                    token = %record.redacted(),
                    enabled = record.enabled,
                    region = %record.region,
                    revision = kv.mod_revision,
                    "Token updated"
                );
                self.cache.apply_put(record)
            }
            WatchEvent::Delete { key, revision } => {
                let Some(token) = key.strip_prefix(&self.options.prefix) else {
                    return;
                };
                debug!(token = %redact(token), revision, "Token deleted");
                self.cache.apply_delete(token)
            }
        };

        if let Some(invalidation) = invalidation {
            info!(token = %redact(&invalidation.token), "Token invalidated");
            self.dispatcher.dispatch(invalidation);
        }
    }

    async fn resync(&self) {
        let result = reload_into(
            &self.cache,
            &self.dispatcher,
            &self.floor,
            self.client.as_ref(),
            &self.options,
        )
        .await;
        match result {
            Ok(count) => info!(tokens = count, "Token cache resynced after reconnect"),
            Err(e) => warn!(error = %e, "Token resync after reconnect failed"),
        }
    }
}
