use md5::{Digest, Md5};
use subtle::ConstantTimeEq;

/// Privilege key for `token` at `timestamp`: lowercase hex MD5 of the token
/// followed by the decimal timestamp.
pub fn auth_key(token: &str, timestamp: i64) -> String {
    let mut hasher = Md5::new();
    hasher.update(token.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison of two privilege keys.
pub fn keys_match(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_key_known_vector() {
        assert_eq!(auth_key("1234", 1488720000), "6df41a43725f0c770fd56379e12acf8c");
    }

    #[test]
    fn test_auth_key_depends_on_both_inputs() {
        let key = auth_key("1234", 1488720000);
        assert_ne!(key, auth_key("1234", 1488720001));
        assert_ne!(key, auth_key("12345", 1488720000));
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_keys_match() {
        let key = auth_key("secret", 42);
        assert!(keys_match(&key, &key.clone()));
        assert!(!keys_match(&key, &auth_key("secret", 43)));
        assert!(!keys_match(&key, ""));
        assert!(!keys_match(&key, &key[..31]));
    }
}
