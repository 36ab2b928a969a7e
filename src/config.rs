//! Configuration for virta
//!
//! Plain scalar values. Hosting services usually build a [`StreamConfig`]
//! from their own configuration system; [`StreamConfig::from_env`] exists for
//! tests, demos and small deployments.

use crate::error::{Result, VirtaError};
use crate::resume::RestartSettings;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Settings for resumable cluster streaming
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Backoff before the first restart of a failed sub-stream
    pub min_backoff: Duration,

    /// Upper bound for the restart backoff
    pub max_backoff: Duration,

    /// Restarts allowed per provider before it is given up
    pub max_restarts: usize,

    /// Elements per batch requested from a provider
    pub burst: u32,

    /// How long to wait for a provider to answer a stream request
    pub stream_request_timeout: Duration,

    /// How long a provider keeps an unconsumed stream open
    pub idle_timeout: Duration,

    /// Providers streamed concurrently
    pub provider_parallelism: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(120),
            max_restarts: 180,
            burst: 25,
            stream_request_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10),
            provider_parallelism: 1,
        }
    }
}

impl StreamConfig {
    /// Load configuration from environment variables
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = StreamConfig::default();

        if let Some(ms) = parse_var::<u64>("VIRTA_MIN_BACKOFF_MS")? {
            config.min_backoff = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64>("VIRTA_MAX_BACKOFF_MS")? {
            config.max_backoff = Duration::from_millis(ms);
        }

        if let Some(restarts) = parse_var("VIRTA_MAX_RESTARTS")? {
            config.max_restarts = restarts;
        }

        if let Some(burst) = parse_var("VIRTA_BURST")? {
            config.burst = burst;
        }

        if let Some(ms) = parse_var::<u64>("VIRTA_REQUEST_TIMEOUT_MS")? {
            config.stream_request_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64>("VIRTA_IDLE_TIMEOUT_MS")? {
            config.idle_timeout = Duration::from_millis(ms);
        }

        if let Some(parallelism) = parse_var("VIRTA_PROVIDER_PARALLELISM")? {
            config.provider_parallelism = parallelism;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants between the values
    pub fn validate(&self) -> Result<()> {
        if self.min_backoff > self.max_backoff {
            return Err(VirtaError::InvalidConfiguration(format!(
                "min_backoff {:?} exceeds max_backoff {:?}",
                self.min_backoff, self.max_backoff
            )));
        }
        if self.burst == 0 {
            return Err(VirtaError::InvalidConfiguration(
                "burst must be positive".to_string(),
            ));
        }
        if self.provider_parallelism == 0 {
            return Err(VirtaError::InvalidConfiguration(
                "provider_parallelism must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Restart settings for one provider's sub-stream
    pub fn restart_settings(&self) -> RestartSettings {
        RestartSettings {
            min_backoff: self.min_backoff,
            max_backoff: self.max_backoff,
            max_restarts: self.max_restarts,
            lookback: 1,
        }
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| VirtaError::Config(format!("invalid {name}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();
        assert_eq!(config.burst, 25);
        assert_eq!(config.provider_parallelism, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_env() {
        // No VIRTA_* variables are set in the test environment
        let config = StreamConfig::from_env().unwrap();
        assert!(config.burst > 0);
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = StreamConfig {
            min_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(VirtaError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_burst() {
        let config = StreamConfig {
            burst: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_restart_settings() {
        let config = StreamConfig {
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(80),
            max_restarts: 4,
            ..Default::default()
        };
        let settings = config.restart_settings();
        assert_eq!(settings.min_backoff, Duration::from_millis(10));
        assert_eq!(settings.max_backoff, Duration::from_millis(80));
        assert_eq!(settings.max_restarts, 4);
        assert_eq!(settings.lookback, 1);
    }
}
