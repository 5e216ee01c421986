//! Environment variable configuration source.
//!
//! Only a small set of operational overrides is honored, highest priority:
//!
//! - `LC_LOG_LEVEL` — overrides `general.log_level`
//! - `LC_HOSTNAME` — overrides the hostname stamped into events

use std::env;
use std::str::FromStr;

use tracing::error;

use crate::config::log_level::LogLevel;
use crate::config::{Config, ConfigError, ConfigSource};

/// Applies `LC_*` environment overrides.
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        if let Ok(value) = env::var("LC_LOG_LEVEL") {
            match LogLevel::from_str(&value) {
                Ok(level) => config.log_level = level,
                Err(e) => error!("CONFIG | LC_LOG_LEVEL ignored: {e}"),
            }
        }
        if let Ok(value) = env::var("LC_HOSTNAME") {
            if !value.is_empty() {
                config.host = value;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_override() {
        env::set_var("LC_HOSTNAME", "override-host");
        let mut config = Config::default();
        EnvSource.load(&mut config).unwrap();
        assert_eq!(config.host, "override-host");
        env::remove_var("LC_HOSTNAME");
    }

    #[test]
    fn test_invalid_log_level_ignored() {
        env::set_var("LC_LOG_LEVEL", "blaring");
        let mut config = Config::default();
        let before = config.log_level;
        EnvSource.load(&mut config).unwrap();
        assert_eq!(config.log_level, before);
        env::remove_var("LC_LOG_LEVEL");
    }
}
