//! Control-message authentication.
//!
//! Clients never send their token. They send a privilege key derived from
//! the token and a timestamp; the server proves possession by recomputing
//! the key for each admissible token and comparing in constant time.

mod key;
mod verifier;

pub use key::{auth_key, keys_match};
pub use verifier::{
    MultiTokenVerifier, StaticTokenVerifier, Verifier, VerifyError, TOKEN_META_KEY,
};
