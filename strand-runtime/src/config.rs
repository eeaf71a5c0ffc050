//! Runtime configuration.
//!
//! Configuration for the relationship manager, master access and
//! auto-reconnector running on one server.

use std::time::Duration;

use strand_core::ServerId;
use strand_routing::DispatcherConfig;

/// Configuration for one strand node.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Logical identity of this server. Replicas on it count as local.
    pub server_id: ServerId,
    /// Master access configuration.
    pub access: AccessConfig,
    /// Reconnect backoff configuration.
    pub reconnect: ReconnectConfig,
    /// Dispatcher configuration.
    pub dispatcher: DispatcherConfig,
}

impl RuntimeConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            access: AccessConfig::default(),
            reconnect: ReconnectConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }

    /// Creates a configuration suitable for testing (shorter timeouts).
    #[must_use]
    pub fn fast_for_testing(server_id: ServerId) -> Self {
        Self {
            server_id,
            access: AccessConfig::fast_for_testing(),
            reconnect: ReconnectConfig::fast_for_testing(),
            dispatcher: DispatcherConfig::default(),
        }
    }

    /// Sets the reconnect configuration.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Validates every section.
    ///
    /// # Errors
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.access.validate()?;
        self.reconnect.validate()?;
        if self.dispatcher.fanout_max == 0 {
            return Err(ConfigError::InvalidDispatcher {
                message: "fanout_max must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for master access handles.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// How long to wait for a primary's admission handshake.
    pub handshake_timeout: Duration,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl AccessConfig {
    /// Creates access config suitable for testing.
    #[must_use]
    pub const fn fast_for_testing() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(500),
        }
    }

    /// Validates the access configuration.
    ///
    /// # Errors
    /// Returns an error if the handshake timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::InvalidAccess {
                message: "handshake_timeout must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Backoff schedule for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay after the first attempt.
    pub initial_backoff: Duration,
    /// Factor applied to the delay after every attempt.
    pub multiplier: f64,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            multiplier: 1.5,
            max_backoff: Duration::from_secs(15),
        }
    }
}

impl ReconnectConfig {
    /// Creates reconnect config suitable for testing (short ceiling).
    #[must_use]
    pub const fn fast_for_testing() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            multiplier: 1.5,
            max_backoff: Duration::from_millis(200),
        }
    }

    /// Returns the delay following `current`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn next_backoff(&self, current: Duration) -> Duration {
        // Whole nanoseconds keep the schedule exact for the default constants.
        let nanos = (current.as_nanos() as f64 * self.multiplier).round();
        let cap = self.max_backoff.as_nanos() as f64;
        Duration::from_nanos(nanos.min(cap) as u64)
    }

    /// Validates the backoff schedule.
    ///
    /// # Errors
    /// Returns an error if the schedule never grows or starts above its cap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::InvalidBackoff {
                message: "initial_backoff must be > 0".to_string(),
            });
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ConfigError::InvalidBackoff {
                message: "multiplier must be a finite value >= 1.0".to_string(),
            });
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::InvalidBackoff {
                message: "max_backoff must be >= initial_backoff".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Invalid master access configuration.
    #[error("invalid access config: {message}")]
    InvalidAccess {
        /// Error description.
        message: String,
    },
    /// Invalid reconnect backoff.
    #[error("invalid backoff: {message}")]
    InvalidBackoff {
        /// Error description.
        message: String,
    },
    /// Invalid dispatcher configuration.
    #[error("invalid dispatcher config: {message}")]
    InvalidDispatcher {
        /// Error description.
        message: String,
    },
}
