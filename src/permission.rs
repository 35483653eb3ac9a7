//! Single-use access permissions.
//!
//! A permission authorizes one WebSocket subscriber (identified by a user
//! id) for every private or presence channel whose name matches the
//! permission's pattern. The token backing it validates at most once.

use regex::Regex;

use crate::error::EngineError;
use crate::token::{self, ACCESS_TOKEN_BYTES};

/// A single-use channel access grant.
#[derive(Debug, Clone)]
pub struct Permission {
    storage_key: u64,
    uid: String,
    source: String,
    pattern: Regex,
    token: String,
}

impl Permission {
    /// Create a permission for `uid` over channels matching `pattern`.
    ///
    /// The pattern is compiled anchored: it must match the whole channel
    /// name, not a substring of it.
    pub fn new(uid: &str, pattern: &str) -> Result<Permission, EngineError> {
        let compiled = compile_pattern(pattern)?;
        Ok(Permission {
            storage_key: 0,
            uid: uid.to_string(),
            source: pattern.to_string(),
            pattern: compiled,
            token: token::generate_token(ACCESS_TOKEN_BYTES),
        })
    }

    /// Rebuild a permission from its stored parts.
    pub(crate) fn from_parts(
        storage_key: u64,
        uid: &str,
        pattern: &str,
        token: String,
    ) -> Result<Permission, EngineError> {
        let compiled = compile_pattern(pattern)?;
        Ok(Permission {
            storage_key,
            uid: uid.to_string(),
            source: pattern.to_string(),
            pattern: compiled,
            token,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// The pattern as it was supplied, for persistence.
    pub fn pattern(&self) -> &str {
        &self.source
    }

    pub(crate) fn storage_key(&self) -> u64 {
        self.storage_key
    }

    pub(crate) fn set_storage_key(&mut self, key: u64) {
        self.storage_key = key;
    }

    /// Whether this permission covers the given channel.
    pub fn is_matching(&self, channel: &str) -> bool {
        self.pattern.is_match(channel)
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, EngineError> {
    Regex::new(&format!(r"\A(?:{})\z", pattern))
        .map_err(|_| EngineError::InvalidPattern(pattern.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_token_shape() {
        let permission = Permission::new("joe", ".*").unwrap();
        assert_eq!(permission.token().len(), 128);
        assert_eq!(permission.uid(), "joe");
    }

    #[test]
    fn test_pattern_is_anchored() {
        let permission = Permission::new("joe", "presence-room").unwrap();
        assert!(permission.is_matching("presence-room"));
        assert!(!permission.is_matching("presence-room-2"));
        assert!(!permission.is_matching("a-presence-room"));
    }

    #[test]
    fn test_wildcard_pattern() {
        let permission = Permission::new("joe", "private-.*").unwrap();
        assert!(permission.is_matching("private-chat"));
        assert!(!permission.is_matching("presence-chat"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            Permission::new("joe", "(["),
            Err(EngineError::InvalidPattern(_))
        ));
    }
}
