//! Control messages checked by the verifiers.
//!
//! Only the fields authentication looks at, plus the identifiers callers
//! need to route sessions. JSON field names follow the tunnel wire format.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::auth::auth_key;

/// Current unix time in seconds, the salt clients sign with.
pub fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// First message of a control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Login {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub privilege_key: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metas: Option<HashMap<String, String>>,
    #[serde(default)]
    pub pool_count: u32,
}

impl Login {
    /// A login carrying the privilege key for `token` at `timestamp`.
    pub fn signed(token: &str, timestamp: i64) -> Self {
        Self {
            privilege_key: auth_key(token, timestamp),
            timestamp,
            ..Default::default()
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metas.as_ref()?.get(key).map(String::as_str)
    }
}

/// Control-connection heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Ping {
    #[serde(default)]
    pub privilege_key: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl Ping {
    pub fn signed(token: &str, timestamp: i64) -> Self {
        Self {
            privilege_key: auth_key(token, timestamp),
            timestamp,
        }
    }
}

/// Sent by a client when it opens a new work connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NewWorkConn {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub privilege_key: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl NewWorkConn {
    pub fn signed(run_id: &str, token: &str, timestamp: i64) -> Self {
        Self {
            run_id: run_id.to_string(),
            privilege_key: auth_key(token, timestamp),
            timestamp,
        }
    }
}
