use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::key::{auth_key, keys_match};
use crate::config::AuthScope;
use crate::protocol::{Login, NewWorkConn, Ping};
use crate::tokens::{redact, TokenError, TokenStore};

/// Login metadata entry holding the token a login was matched to.
pub const TOKEN_META_KEY: &str = "auth_token";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("token validation failed: {0}")]
    TokenValidation(#[from] TokenError),
    #[error("no matching token found")]
    NoMatchingToken,
    #[error("token in heartbeat doesn't match any configured token")]
    InvalidHeartbeat,
    #[error("token in NewWorkConn doesn't match any configured token")]
    InvalidNewWorkConn,
}

/// Server-side check of the three authenticated control messages.
pub trait Verifier: Send + Sync {
    fn verify_login(&self, login: &mut Login) -> Result<(), VerifyError>;
    fn verify_ping(&self, ping: &Ping) -> Result<(), VerifyError>;
    fn verify_new_work_conn(&self, conn: &NewWorkConn) -> Result<(), VerifyError>;
}

/// Verifies messages against every valid token in a [`TokenStore`].
///
/// The privilege key is a one-way function of the secret and a
/// client-chosen timestamp, so there is nothing to index on: each admissible
/// token is tried in turn until one produces the presented key.
pub struct MultiTokenVerifier {
    additional_scopes: Vec<AuthScope>,
    store: Arc<TokenStore>,
}

impl MultiTokenVerifier {
    pub fn new(store: Arc<TokenStore>, additional_scopes: impl IntoIterator<Item = AuthScope>) -> Self {
        Self {
            additional_scopes: additional_scopes.into_iter().collect(),
            store,
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Find the valid token whose key for `timestamp` equals `privilege_key`.
    ///
    /// Holds the store's shared lock for the whole scan and returns on the
    /// first match.
    pub fn find_matching_token(
        &self,
        privilege_key: &str,
        timestamp: i64,
    ) -> Result<String, VerifyError> {
        self.store
            .find_valid(|record| keys_match(&auth_key(&record.token, timestamp), privilege_key))
            .map(|record| record.token)
            .ok_or(VerifyError::NoMatchingToken)
    }

    fn has_scope(&self, scope: AuthScope) -> bool {
        self.additional_scopes.contains(&scope)
    }
}

impl Verifier for MultiTokenVerifier {
    fn verify_login(&self, login: &mut Login) -> Result<(), VerifyError> {
        let token = self.find_matching_token(&login.privilege_key, login.timestamp)?;

        // The record may have changed since the scan released the lock.
        if let Err(e) = self.store.validate_token(&token) {
            warn!(token = %redact(&token), error = %e, "Matched token failed validation");
            return Err(e.into());
        }

        debug!(token = %redact(&token), user = %login.user, "Login verified");
        login
            .metas
            .get_or_insert_with(HashMap::new)
            .insert(TOKEN_META_KEY.to_string(), token);
        Ok(())
    }

    fn verify_ping(&self, ping: &Ping) -> Result<(), VerifyError> {
        if !self.has_scope(AuthScope::HeartBeats) {
            return Ok(());
        }
        self.find_matching_token(&ping.privilege_key, ping.timestamp)
            .map(|_| ())
            .map_err(|_| VerifyError::InvalidHeartbeat)
    }

    fn verify_new_work_conn(&self, conn: &NewWorkConn) -> Result<(), VerifyError> {
        if !self.has_scope(AuthScope::NewWorkConns) {
            return Ok(());
        }
        self.find_matching_token(&conn.privilege_key, conn.timestamp)
            .map(|_| ())
            .map_err(|_| VerifyError::InvalidNewWorkConn)
    }
}

/// Verifies messages against a single shared token, for deployments
/// without a coordination store.
pub struct StaticTokenVerifier {
    additional_scopes: Vec<AuthScope>,
    token: String,
}

impl StaticTokenVerifier {
    pub fn new(token: impl Into<String>, additional_scopes: impl IntoIterator<Item = AuthScope>) -> Self {
        Self {
            additional_scopes: additional_scopes.into_iter().collect(),
            token: token.into(),
        }
    }

    fn matches(&self, privilege_key: &str, timestamp: i64) -> bool {
        keys_match(&auth_key(&self.token, timestamp), privilege_key)
    }
}

impl Verifier for StaticTokenVerifier {
    fn verify_login(&self, login: &mut Login) -> Result<(), VerifyError> {
        if self.matches(&login.privilege_key, login.timestamp) {
            Ok(())
        } else {
            Err(VerifyError::NoMatchingToken)
        }
    }

    fn verify_ping(&self, ping: &Ping) -> Result<(), VerifyError> {
        if !self.additional_scopes.contains(&AuthScope::HeartBeats)
            || self.matches(&ping.privilege_key, ping.timestamp)
        {
            Ok(())
        } else {
            Err(VerifyError::InvalidHeartbeat)
        }
    }

    fn verify_new_work_conn(&self, conn: &NewWorkConn) -> Result<(), VerifyError> {
        if !self.additional_scopes.contains(&AuthScope::NewWorkConns)
            || self.matches(&conn.privilege_key, conn.timestamp)
        {
            Ok(())
        } else {
            Err(VerifyError::InvalidNewWorkConn)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;
    use crate::testutil::{make_record, put_record, start_store};
    use rand::Rng;

    async fn verifier_with(
        records: &[(&str, &str, bool)],
        scopes: &[AuthScope],
    ) -> MultiTokenVerifier {
        let coordinator = MemoryCoordinator::new();
        for (token, region, enabled) in records {
            put_record(&coordinator, &make_record(token, region, *enabled));
        }
        let store = start_store(&coordinator, "us").await;
        MultiTokenVerifier::new(Arc::new(store), scopes.iter().copied())
    }

    #[tokio::test]
    async fn test_find_matching_token_for_any_timestamp() {
        let verifier = verifier_with(
            &[("alpha", "us", true), ("beta", "us", true), ("gamma", "us", true)],
            &[],
        )
        .await;

        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let timestamp: i64 = rng.gen_range(0..4_000_000_000);
            for token in ["alpha", "beta", "gamma"] {
                let key = auth_key(token, timestamp);
                assert_eq!(verifier.find_matching_token(&key, timestamp).unwrap(), token);
            }
        }
    }

    #[tokio::test]
    async fn test_find_matching_token_ignores_invalid_tokens() {
        let verifier = verifier_with(
            &[("on", "us", true), ("off", "us", false), ("foreign", "eu", true)],
            &[],
        )
        .await;

        for token in ["off", "foreign", "unknown"] {
            let key = auth_key(token, 1000);
            assert_eq!(
                verifier.find_matching_token(&key, 1000),
                Err(VerifyError::NoMatchingToken)
            );
        }
        // Right token, wrong timestamp
        let key = auth_key("on", 1000);
        assert_eq!(
            verifier.find_matching_token(&key, 1001),
            Err(VerifyError::NoMatchingToken)
        );
    }

    #[tokio::test]
    async fn test_verify_login_records_token_in_metas() {
        let verifier = verifier_with(&[("alpha", "us", true)], &[]).await;

        let mut login = Login::signed("alpha", 1_700_000_000);
        assert!(login.metas.is_none());
        verifier.verify_login(&mut login).unwrap();
        assert_eq!(login.meta(TOKEN_META_KEY), Some("alpha"));

        let mut with_metas = Login::signed("alpha", 1_700_000_001);
        with_metas.metas = Some(HashMap::from([("tenant".to_string(), "a".to_string())]));
        verifier.verify_login(&mut with_metas).unwrap();
        assert_eq!(with_metas.meta("tenant"), Some("a"));
        assert_eq!(with_metas.meta(TOKEN_META_KEY), Some("alpha"));
    }

    #[tokio::test]
    async fn test_verify_login_rejects_unknown_key() {
        let verifier = verifier_with(&[("alpha", "us", true)], &[]).await;

        let mut login = Login::signed("intruder", 1_700_000_000);
        assert_eq!(
            verifier.verify_login(&mut login),
            Err(VerifyError::NoMatchingToken)
        );
        assert!(login.metas.is_none());
    }

    #[tokio::test]
    async fn test_ping_and_work_conn_skip_without_scope() {
        let verifier = verifier_with(&[("alpha", "us", true)], &[]).await;

        let ping = Ping {
            privilege_key: "garbage".to_string(),
            timestamp: 1,
        };
        let conn = NewWorkConn {
            run_id: "r".to_string(),
            privilege_key: "garbage".to_string(),
            timestamp: 1,
        };
        assert!(verifier.verify_ping(&ping).is_ok());
        assert!(verifier.verify_new_work_conn(&conn).is_ok());
    }

    #[tokio::test]
    async fn test_ping_and_work_conn_checked_with_scope() {
        let verifier = verifier_with(
            &[("alpha", "us", true)],
            &[AuthScope::HeartBeats, AuthScope::NewWorkConns],
        )
        .await;

        assert!(verifier.verify_ping(&Ping::signed("alpha", 5)).is_ok());
        assert_eq!(
            verifier.verify_ping(&Ping::signed("beta", 5)),
            Err(VerifyError::InvalidHeartbeat)
        );

        assert!(verifier
            .verify_new_work_conn(&NewWorkConn::signed("r", "alpha", 5))
            .is_ok());
        assert_eq!(
            verifier.verify_new_work_conn(&NewWorkConn::signed("r", "beta", 5)),
            Err(VerifyError::InvalidNewWorkConn)
        );
    }

    #[tokio::test]
    async fn test_heartbeat_scope_does_not_gate_work_conns() {
        let verifier = verifier_with(&[("alpha", "us", true)], &[AuthScope::HeartBeats]).await;
        assert!(verifier
            .verify_new_work_conn(&NewWorkConn::signed("r", "beta", 5))
            .is_ok());
        assert!(verifier.verify_ping(&Ping::signed("beta", 5)).is_err());
    }

    #[test]
    fn test_static_verifier() {
        let verifier = StaticTokenVerifier::new("shared", [AuthScope::NewWorkConns]);

        assert!(verifier.verify_login(&mut Login::signed("shared", 9)).is_ok());
        assert_eq!(
            verifier.verify_login(&mut Login::signed("other", 9)),
            Err(VerifyError::NoMatchingToken)
        );
        assert!(verifier.verify_ping(&Ping::signed("other", 9)).is_ok());
        assert_eq!(
            verifier.verify_new_work_conn(&NewWorkConn::signed("r", "other", 9)),
            Err(VerifyError::InvalidNewWorkConn)
        );
    }

    #[test]
    fn test_verifier_is_object_safe() {
        let verifier: Box<dyn Verifier> = Box::new(StaticTokenVerifier::new("t", Vec::<AuthScope>::new()));
        assert!(verifier.verify_ping(&Ping::default()).is_ok());
    }
}
