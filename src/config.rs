use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key prefix token records live under when none is configured
pub const DEFAULT_PREFIX: &str = "/frp/tokens/";

/// Default coordination-store dial timeout
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
    #[error("Unknown auth scope: {0}")]
    UnknownScope(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub auth: AuthConfig,
    pub store: StoreConfig,
}

/// Connection settings for the coordination store holding token records.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub dial_timeout_secs: u64,
    pub endpoints: Vec<String>,
    pub password: Option<String>,
    pub prefix: String,
    /// Only tokens with exactly this region are accepted
    pub region: String,
    /// Reload the full snapshot whenever the watch is re-established
    pub resync_on_reconnect: bool,
    pub tls: Option<TlsConfig>,
    pub username: Option<String>,
}

/// Client certificate material for dialing the coordination store.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Extra message kinds that must carry a valid privilege key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthScope {
    HeartBeats,
    NewWorkConns,
}

impl std::str::FromStr for AuthScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HeartBeats" => Ok(AuthScope::HeartBeats),
            "NewWorkConns" => Ok(AuthScope::NewWorkConns),
            other => Err(ConfigError::UnknownScope(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthConfig {
    pub additional_scopes: Vec<AuthScope>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: DEFAULT_DIAL_TIMEOUT_SECS,
            endpoints: Vec::new(),
            password: None,
            prefix: DEFAULT_PREFIX.to_string(),
            region: String::new(),
            resync_on_reconnect: false,
            tls: None,
            username: None,
        }
    }
}

impl StoreConfig {
    /// Check required fields and that referenced TLS files exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region.is_empty() {
            return Err(ConfigError::ValidationError(
                "TOKEN_STORE_REGION cannot be empty".to_string(),
            ));
        }

        if self.endpoints.is_empty() {
            return Err(ConfigError::ValidationError(
                "TOKEN_STORE_ENDPOINTS cannot be empty".to_string(),
            ));
        }

        if self.username.is_some() != self.password.is_some() {
            return Err(ConfigError::ValidationError(
                "TOKEN_STORE_USERNAME and TOKEN_STORE_PASSWORD must be set together".to_string(),
            ));
        }

        if let Some(tls) = &self.tls {
            let files = [Some(&tls.cert_file), Some(&tls.key_file), tls.ca_file.as_ref()];
            for path in files.into_iter().flatten() {
                if !path.is_file() {
                    return Err(ConfigError::ValidationError(format!(
                        "TLS file not found: {}",
                        path.display()
                    )));
                }
            }
        }

        if self.dial_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "TOKEN_STORE_DIAL_TIMEOUT must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoints: Vec<String> = lookup("TOKEN_STORE_ENDPOINTS")
            .map(|e| split_list(&e))
            .unwrap_or_default();

        let region = lookup("TOKEN_STORE_REGION").unwrap_or_default();

        let prefix = lookup("TOKEN_STORE_PREFIX")
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());

        let dial_timeout_secs = match lookup("TOKEN_STORE_DIAL_TIMEOUT") {
            Some(value) => value.trim().parse::<u64>().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "TOKEN_STORE_DIAL_TIMEOUT must be a number of seconds, got {value:?}"
                ))
            })?,
            None => DEFAULT_DIAL_TIMEOUT_SECS,
        };

        let tls = match (lookup("TOKEN_STORE_TLS_CERT"), lookup("TOKEN_STORE_TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                ca_file: lookup("TOKEN_STORE_TLS_CA").map(PathBuf::from),
                cert_file: PathBuf::from(cert),
                key_file: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::ValidationError(
                    "TOKEN_STORE_TLS_CERT and TOKEN_STORE_TLS_KEY must be set together"
                        .to_string(),
                ))
            }
        };

        let resync_on_reconnect = lookup("TOKEN_STORE_RESYNC_ON_RECONNECT")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let additional_scopes = lookup("AUTH_ADDITIONAL_SCOPES")
            .map(|s| {
                split_list(&s)
                    .iter()
                    .map(|scope| scope.parse())
                    .collect::<Result<Vec<AuthScope>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let config = Config {
            auth: AuthConfig { additional_scopes },
            store: StoreConfig {
                dial_timeout_secs,
                endpoints,
                password: lookup("TOKEN_STORE_PASSWORD"),
                prefix,
                region,
                resync_on_reconnect,
                tls,
                username: lookup("TOKEN_STORE_USERNAME"),
            },
        };

        config.store.validate()?;
        Ok(config)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = load(&[
            ("TOKEN_STORE_ENDPOINTS", "http://etcd-0:2379, http://etcd-1:2379,"),
            ("TOKEN_STORE_REGION", "us-east"),
        ])
        .unwrap();

        assert_eq!(
            config.store.endpoints,
            vec!["http://etcd-0:2379", "http://etcd-1:2379"]
        );
        assert_eq!(config.store.region, "us-east");
        assert_eq!(config.store.prefix, DEFAULT_PREFIX);
        assert_eq!(config.store.dial_timeout_secs, 5);
        assert!(config.store.tls.is_none());
        assert!(!config.store.resync_on_reconnect);
        assert!(config.auth.additional_scopes.is_empty());
    }

    #[test]
    fn test_region_and_endpoints_required() {
        assert!(load(&[("TOKEN_STORE_ENDPOINTS", "http://etcd:2379")]).is_err());
        assert!(load(&[("TOKEN_STORE_REGION", "us")]).is_err());
    }

    #[test]
    fn test_scopes_and_overrides() {
        let config = load(&[
            ("TOKEN_STORE_ENDPOINTS", "http://etcd:2379"),
            ("TOKEN_STORE_REGION", "eu"),
            ("TOKEN_STORE_PREFIX", "/tenants/"),
            ("TOKEN_STORE_DIAL_TIMEOUT", "12"),
            ("TOKEN_STORE_USERNAME", "root"),
            ("TOKEN_STORE_PASSWORD", "secret"),
            ("TOKEN_STORE_RESYNC_ON_RECONNECT", "1"),
            ("AUTH_ADDITIONAL_SCOPES", "HeartBeats,NewWorkConns"),
        ])
        .unwrap();

        assert_eq!(config.store.prefix, "/tenants/");
        assert_eq!(config.store.dial_timeout_secs, 12);
        assert_eq!(config.store.username.as_deref(), Some("root"));
        assert!(config.store.resync_on_reconnect);
        assert_eq!(
            config.auth.additional_scopes,
            vec![AuthScope::HeartBeats, AuthScope::NewWorkConns]
        );
    }

    #[test]
    fn test_unknown_scope_rejected() {
        let result = load(&[
            ("TOKEN_STORE_ENDPOINTS", "http://etcd:2379"),
            ("TOKEN_STORE_REGION", "eu"),
            ("AUTH_ADDITIONAL_SCOPES", "HeartBeats,Everything"),
        ]);
        assert!(matches!(result, Err(ConfigError::UnknownScope(s)) if s == "Everything"));
    }

    #[test]
    fn test_bad_dial_timeout_rejected() {
        for timeout in ["0", "five", "-1"] {
            let result = load(&[
                ("TOKEN_STORE_ENDPOINTS", "http://etcd:2379"),
                ("TOKEN_STORE_REGION", "eu"),
                ("TOKEN_STORE_DIAL_TIMEOUT", timeout),
            ]);
            assert!(
                matches!(result, Err(ConfigError::ValidationError(_))),
                "timeout {timeout:?} accepted"
            );
        }
    }

    #[test]
    fn test_credentials_must_be_paired() {
        let result = load(&[
            ("TOKEN_STORE_ENDPOINTS", "http://etcd:2379"),
            ("TOKEN_STORE_REGION", "eu"),
            ("TOKEN_STORE_USERNAME", "root"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_tls_files_must_exist() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("client.pem");
        let key = dir.path().join("client-key.pem");
        std::fs::write(&cert, "cert").unwrap();

        let base = [
            ("TOKEN_STORE_ENDPOINTS", "https://etcd:2379"),
            ("TOKEN_STORE_REGION", "eu"),
        ];
        let cert_str = cert.to_str().unwrap();
        let key_str = key.to_str().unwrap();

        let mut vars = base.to_vec();
        vars.push(("TOKEN_STORE_TLS_CERT", cert_str));
        vars.push(("TOKEN_STORE_TLS_KEY", key_str));
        assert!(load(&vars).is_err());

        std::fs::write(&key, "key").unwrap();
        let config = load(&vars).unwrap();
        let tls = config.store.tls.unwrap();
        assert_eq!(tls.cert_file, cert);
        assert!(tls.ca_file.is_none());

        let mut half = base.to_vec();
        half.push(("TOKEN_STORE_TLS_CERT", cert_str));
        assert!(load(&half).is_err());
    }
}
