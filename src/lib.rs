//! tunnel-auth - Token cache and verifier for a multi-tenant tunnel control plane
//!
//! This crate provides region-scoped tenant token authentication with:
//! - A live mirror of token records kept in a coordination store (etcd)
//! - Snapshot load plus a background watch loop with reconnect
//! - Invalidation callbacks when a valid token is disabled, moved or deleted
//! - Multi-token verification of login/heartbeat/work-connection messages
//!   using timestamp-salted privilege keys and constant-time comparison
//! - A session registry that tears down sessions of invalidated tokens

pub mod auth;
pub mod config;
pub mod coordination;
pub mod protocol;
pub mod sessions;
#[cfg(test)]
pub mod testutil;
pub mod tokens;

pub use auth::{auth_key, MultiTokenVerifier, Verifier, VerifyError};
pub use config::{AuthScope, Config, StoreConfig};
pub use sessions::SessionRegistry;
pub use tokens::{StoreError, TokenError, TokenRecord, TokenStore};
