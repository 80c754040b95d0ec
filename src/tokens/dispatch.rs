//! Invalidation callback dispatch
//!
//! The watch loop never runs callbacks itself. Invalidations are queued on a
//! bounded channel drained by one worker task. The worker hands each callback
//! to the blocking pool and moves on without waiting for it, so a slow
//! callback delays neither event application nor later invalidations.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::record::redact;

/// Hook invoked with the token string when a valid token becomes invalid
/// or is deleted.
pub type InvalidationCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Queue depth before pushes spill into detached tasks
const QUEUE_CAPACITY: usize = 1024;

/// A callback bound to the token it has to be told about.
pub(crate) struct Invalidation {
    pub(crate) token: String,
    callback: InvalidationCallback,
}

impl Invalidation {
    pub fn new(token: String, callback: InvalidationCallback) -> Self {
        Self { token, callback }
    }
}

impl std::fmt::Debug for Invalidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invalidation")
            .field("token", &redact(&self.token))
            .finish()
    }
}

#[derive(Clone)]
pub(crate) struct InvalidationDispatcher {
    tx: mpsc::Sender<Invalidation>,
}

impl InvalidationDispatcher {
    /// Spawn the worker. It stops once `shutdown` fires, the queue has been
    /// drained and every started callback has returned.
    pub fn spawn(shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(run_worker(rx, shutdown));
        Self { tx }
    }

    /// Queue an invalidation without waiting.
    pub fn dispatch(&self, invalidation: Invalidation) {
        match self.tx.try_send(invalidation) {
            Ok(()) => {}
            Err(TrySendError::Full(invalidation)) => {
                warn!(
                    token = %redact(&invalidation.token),
                    capacity = QUEUE_CAPACITY,
                    "Invalidation queue full, deferring"
                );
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if tx.send(invalidation).await.is_err() {
                        debug!("Invalidation worker gone, dropping deferred invalidation");
                    }
                });
            }
            Err(TrySendError::Closed(invalidation)) => {
                debug!(
                    token = %redact(&invalidation.token),
                    "Invalidation worker stopped, dropping invalidation"
                );
            }
        }
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Invalidation>, shutdown: CancellationToken) {
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            Some(_) = running.join_next(), if !running.is_empty() => {}
            next = rx.recv() => match next {
                Some(invalidation) => {
                    running.spawn(invoke(invalidation));
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    // Flush what was queued before shutdown.
    rx.close();
    while let Ok(invalidation) = rx.try_recv() {
        running.spawn(invoke(invalidation));
    }
    while running.join_next().await.is_some() {}
    debug!("Invalidation worker exiting");
}

async fn invoke(invalidation: Invalidation) {
    let Invalidation { token, callback } = invalidation;
    let redacted = redact(&token);

    match tokio::task::spawn_blocking(move || callback(token)).await {
        Ok(()) => debug!(token = %redacted, "Invalidation callback completed"),
        Err(e) if e.is_panic() => {
            error!(token = %redacted, "Invalidation callback panicked")
        }
        Err(e) => warn!(token = %redacted, error = %e, "Invalidation callback aborted"),
    }
}
