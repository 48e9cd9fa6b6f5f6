//! Messenger configuration: entity addressing, polling, and retry policy.

use crate::error::ConfigurationError;
use crate::message::EntityName;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default poll interval for adapter read loops
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Default batch size for peek-lock receives
pub const DEFAULT_RECEIVE_BATCH_SIZE: u32 = 10;

// ============================================================================
// Retry Policy
// ============================================================================

/// Bounded exponential-backoff policy for broker sends.
///
/// The default is three attempts with delays growing from 100ms to 500ms
/// between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub growth: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 500,
            growth: 5.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before the given attempt number (1-based).
    ///
    /// The first attempt is immediate; attempt `n` waits
    /// `base * growth^(n-2)` capped at the maximum delay.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2) as i32;
        let ms = (self.base_delay_ms as f64) * self.growth.powi(exponent);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Validate policy parameters
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::Invalid {
                message: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        if self.growth < 1.0 {
            return Err(ConfigurationError::Invalid {
                message: "retry.growth must be at least 1.0".to_string(),
            });
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigurationError::Invalid {
                message: "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Entity Addressing
// ============================================================================

/// How message types map onto broker entities.
///
/// Point-to-point uses one queue per message type; publish/subscribe uses one
/// topic per type plus a named subscription owned by this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Addressing {
    Queue,
    Topic { subscription: String },
}

impl Default for Addressing {
    fn default() -> Self {
        Self::Queue
    }
}

impl Addressing {
    /// Validate addressing parameters
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::Queue => Ok(()),
            Self::Topic { subscription } => {
                if subscription.is_empty() {
                    return Err(ConfigurationError::Missing {
                        key: "addressing.subscription".to_string(),
                    });
                }
                EntityName::new(subscription.clone()).map_err(|err| {
                    ConfigurationError::Invalid {
                        message: format!("addressing.subscription: {}", err),
                    }
                })?;
                Ok(())
            }
        }
    }
}

// ============================================================================
// Messenger Configuration
// ============================================================================

/// Configuration for [`crate::Messenger`] construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Queue or topic+subscription addressing
    pub addressing: Addressing,
    /// Optional prefix prepended to derived entity names
    pub entity_prefix: Option<String>,
    /// Poll interval for adapter read loops
    pub poll_interval_ms: u64,
    /// Maximum messages per peek-lock receive
    pub receive_batch_size: u32,
    /// Send retry policy
    pub retry: RetryPolicy,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            addressing: Addressing::default(),
            entity_prefix: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            receive_batch_size: DEFAULT_RECEIVE_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl MessengerConfig {
    /// Load configuration from `MESSENGER_*` environment variables layered
    /// over the defaults
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let source = config::Config::builder()
            .add_source(config::Environment::with_prefix("MESSENGER").separator("__"))
            .build()
            .map_err(|err| ConfigurationError::Parsing {
                message: err.to_string(),
            })?;

        let loaded: Self = source
            .try_deserialize()
            .map_err(|err| ConfigurationError::Parsing {
                message: err.to_string(),
            })?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Load configuration from a TOML file layered over the defaults
    pub fn from_file(path: &str) -> Result<Self, ConfigurationError> {
        let source = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(|err| ConfigurationError::Parsing {
                message: err.to_string(),
            })?;

        let loaded: Self = source
            .try_deserialize()
            .map_err(|err| ConfigurationError::Parsing {
                message: err.to_string(),
            })?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Validate all configuration sections
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "poll_interval_ms must be positive".to_string(),
            });
        }
        if self.receive_batch_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "receive_batch_size must be positive".to_string(),
            });
        }
        if let Some(prefix) = &self.entity_prefix {
            EntityName::new(prefix.clone()).map_err(|err| ConfigurationError::Invalid {
                message: format!("entity_prefix: {}", err),
            })?;
        }
        self.addressing.validate()?;
        self.retry.validate()
    }

    /// Poll interval as a std duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
