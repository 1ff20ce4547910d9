//! Maps a presented token to a principal.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use tether_core::ids::Principal;

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<Principal>;
}

/// Static token table keyed by SHA-256 digest.
///
/// With an empty table every non-empty token is accepted and the principal is
/// derived from its digest, so the same token always names the same owner.
#[derive(Debug, Default)]
pub struct TokenAuthenticator {
    digests: HashMap<String, Principal>,
}

impl TokenAuthenticator {
    /// `tokens` maps principal name to token.
    pub fn new<'a>(tokens: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        let digests = tokens
            .into_iter()
            .map(|(principal, token)| (digest(token), Principal::new(principal.clone())))
            .collect();
        Self { digests }
    }

    pub fn is_open(&self) -> bool {
        self.digests.is_empty()
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<Principal> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        let hashed = digest(token);
        if self.is_open() {
            return Some(Principal::new(format!("user_{}", &hashed[..12])));
        }
        self.digests.get(&hashed).cloned()
    }
}

fn digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    to_hex(&hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Token from `?token=` or an `Authorization: Bearer` header.
pub fn extract_token(query_token: Option<&str>, authorization: Option<&str>) -> Option<String> {
    if let Some(t) = query_token.filter(|t| !t.is_empty()) {
        return Some(t.to_string());
    }
    authorization
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
