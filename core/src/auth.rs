use sha2::{Digest, Sha256};

pub const API_KEY_PREFIX: &str = "mind_sk_";
pub const ACCESS_TOKEN_PREFIX: &str = "mind_at_";

/// Kind of bearer credential, detected from its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    ApiKey,
    AccessToken,
}

impl TokenKind {
    pub fn detect(token: &str) -> Option<Self> {
        if token.starts_with(API_KEY_PREFIX) {
            Some(TokenKind::ApiKey)
        } else if token.starts_with(ACCESS_TOKEN_PREFIX) {
            Some(TokenKind::AccessToken)
        } else {
            None
        }
    }
}

/// SHA-256 hex digest of a token string.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract the first 8 chars after `mind_sk_` for display/identification.
pub fn key_prefix(full_key: &str) -> String {
    full_key
        .strip_prefix(API_KEY_PREFIX)
        .map(|rest| rest.chars().take(8).collect())
        .unwrap_or_default()
}
