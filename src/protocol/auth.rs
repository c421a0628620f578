use std::collections::HashSet;

use axum::http::{header, HeaderMap};

/// External credential check for worker connections. Must fail closed.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, credential: &str) -> bool;
}

/// Accepts a fixed set of bearer tokens. An empty set accepts nothing.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl CredentialValidator for StaticTokens {
    fn validate(&self, credential: &str) -> bool {
        !credential.is_empty() && self.tokens.contains(credential)
    }
}

/// Pull a bearer credential out of the `Authorization` header.
pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}
