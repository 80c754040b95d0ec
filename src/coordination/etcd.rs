//! etcd-backed coordination client.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, EventType, GetOptions, Identity, TlsOptions,
    WatchOptions,
};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{CoordinationClient, CoordinationError, KeyValue, Snapshot, WatchEvent, WatchStream};
use crate::config::StoreConfig;

/// Coordination client talking to an etcd v3 cluster.
///
/// `etcd_client::Client` is a cheap handle over a shared channel; every
/// request clones it because the client API takes `&mut self`.
#[derive(Clone)]
pub struct EtcdCoordinator {
    client: Client,
}

impl EtcdCoordinator {
    /// Dial the cluster described by `config`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, CoordinationError> {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(Duration::from_secs(config.dial_timeout_secs));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(username.clone(), password.clone());
        }

        if let Some(tls) = &config.tls {
            let cert = tokio::fs::read(&tls.cert_file).await?;
            let key = tokio::fs::read(&tls.key_file).await?;
            let mut tls_options = TlsOptions::new().identity(Identity::from_pem(cert, key));
            if let Some(ca_file) = &tls.ca_file {
                let ca = tokio::fs::read(ca_file).await?;
                tls_options = tls_options.ca_certificate(Certificate::from_pem(ca));
            }
            options = options.with_tls(tls_options);
        }

        let client = Client::connect(config.endpoints.clone(), Some(options))
            .await
            .map_err(|e| CoordinationError::Connect(e.to_string()))?;

        info!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self { client })
    }
}

#[async_trait]
impl CoordinationClient for EtcdCoordinator {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, CoordinationError> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| CoordinationError::Request(e.to_string()))?;

        let mut kvs = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            match kv.key_str() {
                Ok(key) => kvs.push(KeyValue {
                    key: key.to_string(),
                    value: kv.value().to_vec(),
                    mod_revision: kv.mod_revision(),
                }),
                Err(e) => warn!(error = %e, "Skipping etcd key that is not valid UTF-8"),
            }
        }
        Ok(Snapshot {
            kvs,
            revision: response.header().map_or(0, |header| header.revision()),
        })
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, CoordinationError> {
        let mut client = self.client.clone();
        let (watcher, stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| CoordinationError::Request(e.to_string()))?;
        debug!(prefix = %prefix, watch_id = watcher.watch_id(), "etcd watch established");

        // The watcher handle travels with the stream: dropping it cancels the watch.
        let events = futures_util::stream::unfold(
            (watcher, stream),
            |(watcher, mut stream)| async move {
                match stream.message().await {
                    Ok(Some(response)) => {
                        if response.canceled() {
                            warn!(reason = %response.cancel_reason(), "etcd watch canceled");
                            return None;
                        }
                        let batch: Vec<WatchEvent> =
                            response.events().iter().filter_map(convert_event).collect();
                        Some((futures_util::stream::iter(batch), (watcher, stream)))
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!(error = %e, "etcd watch stream failed");
                        None
                    }
                }
            },
        )
        .flatten();

        Ok(Box::pin(events))
    }
}

fn convert_event(event: &etcd_client::Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    let key = match kv.key_str() {
        Ok(key) => key.to_string(),
        Err(e) => {
            warn!(error = %e, "Skipping etcd event with non UTF-8 key");
            return None;
        }
    };

    Some(match event.event_type() {
        EventType::Put => WatchEvent::Put(KeyValue {
            key,
            value: kv.value().to_vec(),
            mod_revision: kv.mod_revision(),
        }),
        EventType::Delete => WatchEvent::Delete {
            key,
            revision: kv.mod_revision(),
        },
    })
}
