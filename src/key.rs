//! Canonical identifiers: tracked keys and client ids.
//!
//! Raw request strings are parsed into these types at the service boundary.
//! Everything past that boundary (pool, reconciler, sessions) works only with
//! already-normalized values, so the pool never has to validate a key itself.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Maximum length of a normalized key.
pub const MAX_KEY_LEN: usize = 32;

/// Maximum length of a client id.
pub const MAX_CLIENT_ID_LEN: usize = 128;

/// A normalized identifier for a tracked quantity (e.g. a ticker symbol).
///
/// Keys are trimmed and upper-cased on parse; equality is exact string
/// equality of the normalized form.
///
/// # Examples
///
/// ```
/// use quotepool::Key;
///
/// let key = Key::parse("  brk.b ").unwrap();
/// assert_eq!(key.as_str(), "BRK.B");
/// assert_eq!(key, "BRK.B".parse().unwrap());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key(String);

impl Key {
    /// Parses and normalizes a raw key.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyKey`, `ValidationError::FieldTooLong` or
    /// `ValidationError::InvalidKey` when the input cannot be a key.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let normalized = raw.trim().to_ascii_uppercase();
        if normalized.is_empty() {
            return Err(ValidationError::EmptyKey);
        }
        if normalized.len() > MAX_KEY_LEN {
            return Err(ValidationError::FieldTooLong {
                field: "key".to_string(),
                max_length: MAX_KEY_LEN,
            });
        }
        if !normalized.chars().all(is_key_char) {
            return Err(ValidationError::InvalidKey { key: normalized });
        }
        Ok(Self(normalized))
    }

    /// Returns the normalized key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Covers plain tickers plus index (^GSPC), FX (EURUSD=X) and exchange-qualified
// (NASDAQ:AAPL) forms.
fn is_key_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '.' | '^' | '=' | ':' | '_' | '/' | '-')
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Key {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Key {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A non-empty identifier of a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    /// Parses a raw client id.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyClientId` or `ValidationError::FieldTooLong`.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyClientId);
        }
        if trimmed.len() > MAX_CLIENT_ID_LEN {
            return Err(ValidationError::FieldTooLong {
                field: "client_id".to_string(),
                max_length: MAX_CLIENT_ID_LEN,
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the client id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ClientId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

/// Unique identifier for one stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
