//! Raw client requests and their validated forms.
//!
//! Transports deserialize these shapes straight off the wire and call
//! `validate()` before anything reaches a session.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::key::{ClientId, Key};

/// A request to open a quote stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Caller-supplied client identifier.
    pub client_id: String,
    /// Keys the client is initially interested in.
    #[serde(default)]
    pub keys: Vec<String>,
}

/// A validated `StreamRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedStreamRequest {
    /// The parsed client id.
    pub client_id: ClientId,
    /// Normalized keys, deduplicated and sorted.
    pub keys: BTreeSet<Key>,
}

impl StreamRequest {
    /// Parses the client id and every key.
    ///
    /// Keys are normalized first, so `aapl` and `AAPL ` count once.
    ///
    /// # Errors
    ///
    /// Returns the first `ValidationError` encountered, or
    /// `ValidationError::TooManyKeys` when more than `max_keys` distinct keys
    /// remain.
    pub fn validate(&self, max_keys: usize) -> Result<ValidatedStreamRequest, ValidationError> {
        let client_id = ClientId::parse(&self.client_id)?;
        let keys = self
            .keys
            .iter()
            .map(|raw| Key::parse(raw))
            .collect::<Result<BTreeSet<_>, _>>()?;
        if keys.len() > max_keys {
            return Err(ValidationError::TooManyKeys {
                max: max_keys,
                actual: keys.len(),
            });
        }
        Ok(ValidatedStreamRequest { client_id, keys })
    }
}

/// Direction of an interest change.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestAction {
    Add,
    Remove,
}

/// A request to add or remove one key from a live stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestChange {
    /// Client the change applies to.
    pub client_id: String,
    /// Add or remove; required.
    pub action: Option<InterestAction>,
    /// The key to change.
    pub key: String,
}

/// A validated interest change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterestOp {
    /// Start streaming the key.
    Add(Key),
    /// Stop streaming the key.
    Remove(Key),
}

impl InterestOp {
    /// The key this operation targets.
    #[must_use]
    pub fn key(&self) -> &Key {
        match self {
            Self::Add(key) | Self::Remove(key) => key,
        }
    }
}

impl InterestChange {
    /// Parses the change into its client id and operation.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingField` without an action, or the
    /// client id / key parse error.
    pub fn validate(&self) -> Result<(ClientId, InterestOp), ValidationError> {
        let client_id = ClientId::parse(&self.client_id)?;
        let action = self.action.ok_or_else(|| ValidationError::MissingField {
            field: "action".to_string(),
        })?;
        let key = Key::parse(&self.key)?;
        let op = match action {
            InterestAction::Add => InterestOp::Add(key),
            InterestAction::Remove => InterestOp::Remove(key),
        };
        Ok((client_id, op))
    }
}
