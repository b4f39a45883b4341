use std::collections::HashMap;

use ferry_sessions::Caller;

/// Maps the token presented in `hello` to a caller identity.
pub trait Authenticator: Send + Sync {
    /// Returns `None` when the token is unknown.
    fn authenticate(&self, token: &str) -> Option<Caller>;
}

/// Fixed token table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Caller>,
}

impl StaticTokens {
    pub fn new(tokens: HashMap<String, Caller>) -> Self {
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, token: &str) -> Option<Caller> {
        if token.is_empty() {
            return None;
        }
        self.tokens.get(token).cloned()
    }
}
