use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a cached token cannot be used by this store instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token not found")]
    NotFound,
    #[error("token region mismatch: expected {expected}, got {actual}")]
    RegionMismatch { expected: String, actual: String },
    #[error("token is disabled")]
    Disabled,
}

/// A port or inclusive port span a token is allowed to bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PortRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single: Option<u16>,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            single: Some(port),
            ..Default::default()
        }
    }

    pub fn span(start: u16, end: u16) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            single: None,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        if let Some(single) = self.single {
            return single == port;
        }
        match (self.start, self.end) {
            (Some(start), Some(end)) => (start..=end).contains(&port),
            (Some(start), None) => start == port,
            _ => false,
        }
    }
}

/// One tenant credential, stored as JSON under `{prefix}{token}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenRecord {
    /// Opaque secret, unique key in the cache
    pub token: String,
    /// Only stores configured with exactly this region accept the token
    pub region: String,
    pub allow_ports: Vec<PortRange>,
    /// Opaque bandwidth quantity, e.g. "10MB"
    pub bandwidth_limit: String,
    pub max_ports_per_client: i64,
    pub enabled: bool,
    pub description: String,
    #[serde(rename = "trafficReportIntervalMB")]
    pub traffic_report_interval_mb: i64,
}

impl TokenRecord {
    /// Check the record against a store region.
    ///
    /// Region is checked before the enabled flag, so a record from another
    /// region reports `RegionMismatch` whether or not it is enabled.
    pub fn check(&self, region: &str) -> Result<(), TokenError> {
        if self.region != region {
            return Err(TokenError::RegionMismatch {
                expected: region.to_string(),
                actual: self.region.clone(),
            });
        }
        if !self.enabled {
            return Err(TokenError::Disabled);
        }
        Ok(())
    }

    pub fn is_valid_for(&self, region: &str) -> bool {
        self.enabled && self.region == region
    }

    /// Whether `port` falls in one of the allowed ranges. An empty list
    /// allows every port.
    pub fn allows_port(&self, port: u16) -> bool {
        self.allow_ports.is_empty() || self.allow_ports.iter().any(|r| r.contains(port))
    }

    pub fn redacted(&self) -> String {
        redact(&self.token)
    }
}

/// Shorten a secret for log output.
pub fn redact(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    format!("{visible}***")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_full_record() {
        let json = r#"{
            "token": "tok-1",
            "region": "us-east",
            "allowPorts": [{"single": 6000}, {"start": 7000, "end": 7100}],
            "bandwidthLimit": "10MB",
            "maxPortsPerClient": 5,
            "enabled": true,
            "description": "tenant a",
            "trafficReportIntervalMB": 100
        }"#;

        let record: TokenRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.token, "tok-1");
        assert_eq!(record.region, "us-east");
        assert_eq!(record.allow_ports.len(), 2);
        assert_eq!(record.bandwidth_limit, "10MB");
        assert_eq!(record.max_ports_per_client, 5);
        assert!(record.enabled);
        assert_eq!(record.traffic_report_interval_mb, 100);
    }

    #[test]
    fn test_missing_fields_default() {
        let record: TokenRecord = serde_json::from_str(r#"{"token": "t"}"#).unwrap();
        assert!(!record.enabled);
        assert!(record.region.is_empty());
        assert!(record.allow_ports.is_empty());
    }

    #[test]
    fn test_serialize_uses_wire_names() {
        let record = TokenRecord {
            token: "t".to_string(),
            traffic_report_interval_mb: 7,
            ..Default::default()
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["trafficReportIntervalMB"], 7);
        assert!(value.get("allowPorts").is_some());
        assert!(value.get("maxPortsPerClient").is_some());
    }

    #[test]
    fn test_check_region_before_enabled() {
        let mut record = TokenRecord {
            token: "t".to_string(),
            region: "eu".to_string(),
            enabled: false,
            ..Default::default()
        };
        assert!(matches!(
            record.check("us"),
            Err(TokenError::RegionMismatch { .. })
        ));
        assert_eq!(record.check("eu"), Err(TokenError::Disabled));

        record.enabled = true;
        assert!(record.check("eu").is_ok());
        assert!(record.is_valid_for("eu"));
        assert!(!record.is_valid_for("us"));
    }

    #[test]
    fn test_port_ranges() {
        assert!(PortRange::single(80).contains(80));
        assert!(!PortRange::single(80).contains(81));
        assert!(PortRange::span(1000, 2000).contains(1000));
        assert!(PortRange::span(1000, 2000).contains(2000));
        assert!(!PortRange::span(1000, 2000).contains(2001));

        let mut record = TokenRecord::default();
        assert!(record.allows_port(1));
        record.allow_ports = vec![PortRange::span(6000, 6010)];
        assert!(record.allows_port(6005));
        assert!(!record.allows_port(22));
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact("abcdefgh"), "abcd***");
        assert_eq!(redact("ab"), "ab***");
    }
}
