//! Subscription Keys
//!
//! Domain type for the identifier a client subscribes to (a ticker symbol).
//!
//! # Design
//!
//! Keys are case-insensitive on the way in and canonical on the way out:
//! raw input is trimmed and uppercased, then checked against the ticker
//! syntax (3 to 15 ASCII letters or digits). Everything past the boundary
//! works with [`SubscriptionKey`] only, so the pool never sees two spellings
//! of the same ticker.

use std::fmt;

use serde::Serialize;

/// Minimum accepted key length.
pub const MIN_KEY_LEN: usize = 3;

/// Maximum accepted key length.
pub const MAX_KEY_LEN: usize = 15;

// =============================================================================
// Subscription Key
// =============================================================================

/// A normalized subscription key (uppercase ticker symbol).
///
/// # Example
///
/// ```rust
/// use price_stream_pool::domain::subscription::SubscriptionKey;
///
/// let key = SubscriptionKey::parse(" btcusdt ").unwrap();
/// assert_eq!(key.as_str(), "BTCUSDT");
///
/// assert!(SubscriptionKey::parse("ab").is_err());
/// assert!(SubscriptionKey::parse("BTC-USD").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    /// Normalize and validate a raw key.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidKeyError`] if the trimmed key is not 3 to 15
    /// ASCII alphanumeric characters.
    pub fn parse(raw: &str) -> Result<Self, InvalidKeyError> {
        let normalized = raw.trim().to_ascii_uppercase();

        let len = normalized.chars().count();
        if !(MIN_KEY_LEN..=MAX_KEY_LEN).contains(&len) {
            return Err(InvalidKeyError::Length {
                raw: raw.to_string(),
                len,
            });
        }

        if let Some(ch) = normalized.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(InvalidKeyError::Character {
                raw: raw.to_string(),
                ch,
            });
        }

        Ok(Self(normalized))
    }

    /// Get the canonical key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SubscriptionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for SubscriptionKey {
    type Error = InvalidKeyError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// A raw key failed the ticker syntax check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidKeyError {
    /// Key length outside the accepted range.
    #[error("invalid ticker format {raw:?}: length {len} not in {MIN_KEY_LEN}..={MAX_KEY_LEN}")]
    Length {
        /// The key as supplied by the caller.
        raw: String,
        /// Length after trimming.
        len: usize,
    },
    /// Key contains a character that is not an ASCII letter or digit.
    #[error("invalid ticker format {raw:?}: unexpected character {ch:?}")]
    Character {
        /// The key as supplied by the caller.
        raw: String,
        /// First offending character.
        ch: char,
    },
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("BTCUSDT", "BTCUSDT" ; "already canonical")]
    #[test_case("btcusdt", "BTCUSDT" ; "lowercase is uppercased")]
    #[test_case("  EthUsdt\t", "ETHUSDT" ; "surrounding whitespace trimmed")]
    #[test_case("ABC", "ABC" ; "minimum length")]
    #[test_case("A1B2C3D4E5F6G7H", "A1B2C3D4E5F6G7H" ; "maximum length")]
    #[test_case("123", "123" ; "digits only")]
    fn parse_accepts(raw: &str, expected: &str) {
        let key = SubscriptionKey::parse(raw).unwrap();
        assert_eq!(key.as_str(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("AB" ; "too short")]
    #[test_case("   " ; "whitespace only")]
    #[test_case("ABCDEFGHIJKLMNOP" ; "too long")]
    fn parse_rejects_length(raw: &str) {
        assert!(matches!(
            SubscriptionKey::parse(raw),
            Err(InvalidKeyError::Length { .. })
        ));
    }

    #[test_case("BTC-USD", '-' ; "dash")]
    #[test_case("BTC USD", ' ' ; "inner space")]
    #[test_case("BTC/USD", '/' ; "slash")]
    #[test_case("ÄPFEL", 'Ä' ; "non ascii")]
    fn parse_rejects_character(raw: &str, bad: char) {
        match SubscriptionKey::parse(raw) {
            Err(InvalidKeyError::Character { ch, .. }) => assert_eq!(ch, bad),
            other => panic!("expected character error, got {other:?}"),
        }
    }

    #[test]
    fn keys_differing_in_case_are_equal() {
        let a = SubscriptionKey::parse("solusdt").unwrap();
        let b = SubscriptionKey::parse("SOLUSDT").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn display_and_serialize_use_canonical_form() {
        let key = SubscriptionKey::parse("aapl").unwrap();
        assert_eq!(key.to_string(), "AAPL");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"AAPL\"");
    }

    #[test]
    fn error_message_mentions_input() {
        let err = SubscriptionKey::parse("x!").unwrap_err();
        assert!(err.to_string().contains("invalid ticker format"));
        assert!(err.to_string().contains("x!"));
    }
}
