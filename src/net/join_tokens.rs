//! Join tokens provisioned by the host for one instance

use hashbrown::HashMap;

use crate::game::constants::session::JOIN_TOKEN_TTL;

/// Single-use join tokens with an expiry in game time
#[derive(Debug, Default)]
pub struct JoinTokenStore {
    /// token -> game time (seconds) after which it is no longer valid
    tokens: HashMap<String, f64>,
    ttl: f64,
}

impl JoinTokenStore {
    pub fn new() -> Self {
        Self::with_ttl(JOIN_TOKEN_TTL)
    }

    pub fn with_ttl(ttl_secs: f32) -> Self {
        Self {
            tokens: HashMap::new(),
            ttl: ttl_secs as f64,
        }
    }

    /// Provision tokens; re-adding a token refreshes its expiry
    pub fn add<I, S>(&mut self, tokens: I, now: f64)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let expires_at = now + self.ttl;
        for token in tokens {
            let token = token.into();
            if token.is_empty() {
                continue;
            }
            self.tokens.insert(token, expires_at);
        }
    }

    /// Use a token. Succeeds at most once per provisioning.
    pub fn consume(&mut self, token: &str, now: f64) -> bool {
        match self.tokens.remove(token) {
            Some(expires_at) => now <= expires_at,
            None => false,
        }
    }

    /// Drop expired tokens; returns how many were dropped
    pub fn purge_expired(&mut self, now: f64) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, expires_at| now <= *expires_at);
        before - self.tokens.len()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_once() {
        let mut store = JoinTokenStore::new();
        store.add(["abc", "def"], 0.0);
        assert_eq!(store.len(), 2);

        assert!(store.consume("abc", 1.0));
        assert!(!store.consume("abc", 1.0));
        assert!(!store.consume("unknown", 1.0));
        assert!(store.contains("def"));
    }

    #[test]
    fn test_expiry() {
        let mut store = JoinTokenStore::with_ttl(5.0);
        store.add(["late"], 0.0);
        assert!(!store.consume("late", 5.5));
        assert!(!store.contains("late"));

        store.add(["a", "b"], 10.0);
        assert_eq!(store.purge_expired(12.0), 0);
        assert_eq!(store.purge_expired(15.1), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_refresh_and_empty_tokens() {
        let mut store = JoinTokenStore::with_ttl(5.0);
        store.add(["tok", ""], 0.0);
        assert_eq!(store.len(), 1);
        store.add(["tok"], 4.0);
        assert!(store.consume("tok", 8.0));
    }
}
