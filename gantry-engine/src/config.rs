//! Engine configuration
//!
//! All tunables for the engine process: the provenance database location,
//! the polling cadence for pull-only sites and the event fan-out capacity.

use std::time::Duration;

/// Engine configuration
///
/// Poll intervals bound the load placed on remote schedulers: polling starts
/// at `poll_interval` and backs off toward `poll_interval_max` while a job's
/// status is unchanged.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Connection string for the provenance database.
    pub database_url: String,

    /// Base interval between status polls of a tracked job.
    pub poll_interval: Duration,

    /// Ceiling the per-job interval backs off to while nothing changes.
    pub poll_interval_max: Duration,

    /// Buffered capacity of the status event fan-out channel.
    pub event_capacity: usize,
}

impl EngineConfig {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - GANTRY_DATABASE_URL (optional, default: sqlite://gantry.db?mode=rwc)
    /// - GANTRY_POLL_INTERVAL (optional, seconds, default: 5)
    /// - GANTRY_POLL_INTERVAL_MAX (optional, seconds, default: 300)
    /// - GANTRY_EVENT_CAPACITY (optional, default: 256)
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("GANTRY_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://gantry.db?mode=rwc".to_string());

        let poll_interval = std::env::var("GANTRY_POLL_INTERVAL")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));

        let poll_interval_max = std::env::var("GANTRY_POLL_INTERVAL_MAX")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));

        let event_capacity = std::env::var("GANTRY_EVENT_CAPACITY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(256);

        Ok(Self {
            database_url,
            poll_interval,
            poll_interval_max,
            event_capacity,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.is_empty() {
            anyhow::bail!("database_url cannot be empty");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.poll_interval_max < self.poll_interval {
            anyhow::bail!("poll_interval_max must be at least poll_interval");
        }

        if self.event_capacity == 0 {
            anyhow::bail!("event_capacity must be greater than 0");
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://gantry.db?mode=rwc".to_string(),
            poll_interval: Duration::from_secs(5),
            poll_interval_max: Duration::from_secs(300),
            event_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.poll_interval_max, Duration::from_secs(300));
        assert_eq!(config.event_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());

        config.database_url = String::new();
        assert!(config.validate().is_err());
        config.database_url = "sqlite::memory:".to_string();

        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.poll_interval = Duration::from_secs(5);

        // ceiling below the base interval is inconsistent
        config.poll_interval_max = Duration::from_secs(1);
        assert!(config.validate().is_err());
        config.poll_interval_max = Duration::from_secs(300);

        assert!(config.validate().is_ok());
    }
}
