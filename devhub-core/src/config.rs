//! Shared configuration plumbing for the core components.
//!
//! Every component config derives `Serialize`/`Deserialize` so the server can
//! load it from files and environment variables. Durations are written as
//! integer milliseconds (`*_ms` keys) through [`duration_ms`].

use thiserror::Error;

/// A configuration value failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration for {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Rejects zero for fields documented as `>= 1`.
pub(crate) fn require_positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::new(field, "must be at least 1"));
    }
    Ok(())
}

/// Serde adapter storing a [`std::time::Duration`] as milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "duration_ms")]
        wait_ms: Duration,
    }

    #[test]
    fn test_duration_written_as_millis() {
        let json = serde_json::to_string(&Sample {
            wait_ms: Duration::from_millis(1500),
        })
        .unwrap();
        assert_eq!(json, r#"{"wait_ms":1500}"#);

        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back.wait_ms, Duration::from_millis(1500));
    }

    #[test]
    fn test_require_positive() {
        assert!(require_positive("max_attempts", 1).is_ok());
        let err = require_positive("max_attempts", 0).unwrap_err();
        assert_eq!(err.field, "max_attempts");
        assert!(err.to_string().contains("at least 1"));
    }
}
