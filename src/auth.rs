//! Tokens, salts, and password derivation.
//!
//! Bearer tokens are 48 alphanumerics drawn from the thread RNG.  The wire
//! contract is only the 48-character draw; nothing here relies on the tokens
//! being unguessable beyond that.
//!
//! Passwords never arrive in the clear: the client submits base64 of a
//! client-side hash, and the server stores base64 of
//! `SHA3-256(client_hash || salt)` alongside the base64 salt.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha3::{Digest, Sha3_256};

use crate::store::UserRecord;

pub const TOKEN_LEN: usize = 48;
pub const SALT_LEN: usize = 64;

/// In-memory token -> NPID map, seeded from the persisted index at startup.
///
/// The cache only grows or is explicitly re-pointed while the process runs;
/// it is always a superset of the persisted `tokens` table.
#[derive(Debug, Default)]
pub struct TokenCache {
    inner: Mutex<HashMap<String, String>>,
}

impl TokenCache {
    /// Load every persisted binding.  Returns how many were seeded.
    pub fn seed(&self, tokens: &BTreeMap<String, String>) -> usize {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for (token, npid) in tokens {
            cache.insert(token.clone(), npid.clone());
        }
        cache.len()
    }

    pub fn insert(&self, token: &str, npid: &str) {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(token.to_string(), npid.to_string());
    }

    pub fn remove(&self, token: &str) {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(token);
    }

    pub fn npid_for(&self, token: &str) -> Option<String> {
        let cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(token).cloned()
    }
}

/// 48-character alphanumeric bearer token.
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// 64 random salt bytes.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill(&mut salt[..]);
    salt
}

/// `SHA3-256(client_hash || salt)`, base64-encoded for storage/comparison.
pub fn derive_password(client_hash: &[u8], salt: &[u8]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(client_hash);
    hasher.update(salt);
    BASE64.encode(hasher.finalize())
}

pub fn encode_salt(salt: &[u8]) -> String {
    BASE64.encode(salt)
}

/// Check a submitted base64 client hash against a stored record.
/// Any undecodable input simply fails the check.
pub fn verify_password(user: &UserRecord, base64_client_hash: &str) -> bool {
    let Ok(client_hash) = BASE64.decode(base64_client_hash) else {
        return false;
    };
    let Ok(salt) = BASE64.decode(&user.salt) else {
        return false;
    };
    derive_password(&client_hash, &salt) == user.password
}

/// Derive the stored password string for a fresh salt from a submitted
/// base64 client hash.  Undecodable input hashes as empty bytes.
pub fn password_from_submission(base64_client_hash: &str, salt: &[u8]) -> String {
    let client_hash = BASE64.decode(base64_client_hash).unwrap_or_default();
    derive_password(&client_hash, salt)
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("Authorization")?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user(base64_client_hash: &str) -> UserRecord {
        let salt = generate_salt();
        UserRecord {
            quota_used: 0,
            password: password_from_submission(base64_client_hash, &salt),
            salt: encode_salt(&salt),
            token: generate_token(),
            created_at: 0,
            last_login: 0,
            last_activity: 0,
            remote_addr: Vec::new(),
        }
    }

    #[test]
    fn token_is_48_alphanumerics() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn password_roundtrip() {
        let submitted = BASE64.encode(b"client-side-hash");
        let user = test_user(&submitted);
        assert!(verify_password(&user, &submitted));
        assert!(!verify_password(&user, &BASE64.encode(b"wrong-hash")));
        assert!(!verify_password(&user, "not!base64!!"));
    }

    #[test]
    fn same_hash_different_salt_differs() {
        let submitted = BASE64.encode(b"client-side-hash");
        let a = test_user(&submitted);
        let b = test_user(&submitted);
        assert_ne!(a.password, b.password);
        assert!(verify_password(&a, &submitted));
        assert!(verify_password(&b, &submitted));
    }

    #[test]
    fn cache_seed_and_lookup() {
        let cache = TokenCache::default();
        let mut tokens = BTreeMap::new();
        tokens.insert("t1".to_string(), "alice".to_string());
        assert_eq!(cache.seed(&tokens), 1);
        assert_eq!(cache.npid_for("t1").as_deref(), Some("alice"));

        cache.insert("t2", "bob");
        assert_eq!(cache.npid_for("t2").as_deref(), Some("bob"));
        cache.remove("t1");
        assert!(cache.npid_for("t1").is_none());
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert("Authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));

        headers.insert("Authorization", "Basic abc123".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert("Authorization", "Bearer ".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }
}
