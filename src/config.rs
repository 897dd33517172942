//! Pool and session configuration.
//!
//! Every knob has a default; external configuration is accepted as JSON with
//! durations given in milliseconds. Missing fields keep their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QuoteError, QuoteResult, ValidationError};

/// Upper bound on the session re-delivery delay.
pub const MAX_REDELIVER_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on the pool idle window.
pub const MAX_IDLE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration of a `KeyedResourcePool`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Max resource opens in flight at once.
    pub open_concurrency: usize,
    /// Max resources open (or opening) at once.
    pub max_open_resources: usize,
    /// How long a vacated key's resource stays open awaiting re-subscription.
    #[serde(rename = "idle_window_ms", with = "duration_ms")]
    pub idle_window: Duration,
    /// A queued open older than this is re-enqueued fresh at `Hot`.
    #[serde(rename = "queue_timeout_ms", with = "duration_ms")]
    pub queue_timeout: Duration,
    /// Soft capacity of the admission queue; new requests beyond it are dropped.
    pub queue_capacity: usize,
    /// Retries granted to a failed open whose key is still wanted.
    pub max_open_retries: u32,
    /// Max queued resource pushes before new pushes are dropped.
    pub push_queue_capacity: usize,
    /// Upper bound on how long the worker sleeps between maintenance passes.
    #[serde(rename = "maintenance_interval_ms", with = "duration_ms")]
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            open_concurrency: 2,
            max_open_resources: 16,
            idle_window: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(20),
            queue_capacity: 256,
            max_open_retries: 1,
            push_queue_capacity: 4096,
            maintenance_interval: Duration::from_millis(50),
        }
    }
}

impl PoolConfig {
    /// Checks that every ceiling is usable and the idle window is at most
    /// `MAX_IDLE_WINDOW`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` naming the first bad knob.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let zero = [
            ("open_concurrency", self.open_concurrency),
            ("max_open_resources", self.max_open_resources),
            ("queue_capacity", self.queue_capacity),
            ("push_queue_capacity", self.push_queue_capacity),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, v)| *v == 0) {
            return Err(ValidationError::InvalidConfig {
                reason: format!("{name} must be at least 1"),
            });
        }
        if self.maintenance_interval.is_zero() {
            return Err(ValidationError::InvalidConfig {
                reason: "maintenance_interval must be non-zero".to_string(),
            });
        }
        if self.idle_window > MAX_IDLE_WINDOW {
            return Err(ValidationError::InvalidConfig {
                reason: format!("idle_window must not exceed {}s", MAX_IDLE_WINDOW.as_secs()),
            });
        }
        Ok(())
    }

    /// Parses a JSON document and validates it.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed JSON or unusable values.
    pub fn from_json_str(json: &str) -> QuoteResult<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| {
            QuoteError::Validation(ValidationError::InvalidConfig {
                reason: format!("invalid pool config: {e}"),
            })
        })?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Configuration of a `StreamSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay before cached values are re-emitted after a reconciliation.
    #[serde(rename = "redeliver_delay_ms", with = "duration_ms")]
    pub redeliver_delay: Duration,
    /// Max keys one client may be interested in.
    pub max_interest_keys: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            redeliver_delay: Duration::from_millis(250),
            max_interest_keys: 512,
        }
    }
}

impl SessionConfig {
    /// Checks the session limits.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for a zero key limit.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_interest_keys == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "max_interest_keys must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// The re-delivery delay, clamped to `MAX_REDELIVER_DELAY`.
    #[must_use]
    pub fn effective_redeliver_delay(&self) -> Duration {
        self.redeliver_delay.min(MAX_REDELIVER_DELAY)
    }

    /// Parses a JSON document and validates it.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed JSON or unusable values.
    pub fn from_json_str(json: &str) -> QuoteResult<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| {
            QuoteError::Validation(ValidationError::InvalidConfig {
                reason: format!("invalid session config: {e}"),
            })
        })?;
        cfg.validate()?;
        Ok(cfg)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
