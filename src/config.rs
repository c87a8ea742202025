//! Server configuration
//!
//! Read from environment variables with compiled defaults. The bind
//! address may also be given as the first command-line argument, which
//! takes precedence over the environment.

use std::env;
use std::time::Duration;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:3001";

/// Default grace period before an unbound session is evicted
pub const DEFAULT_GRACE_SECS: u64 = 30;

/// Default waiting pool capacity
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Default cap on simultaneously active pairs
pub const DEFAULT_PAIR_CAPACITY: usize = 4096;

/// Runtime configuration for the server
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP bind address
    pub addr: String,
    /// How long a dropped session stays resumable
    pub grace_period: Duration,
    /// Maximum sessions waiting for a partner
    pub pool_capacity: usize,
    /// Maximum simultaneously active pairs
    pub pair_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            grace_period: Duration::from_secs(DEFAULT_GRACE_SECS),
            pool_capacity: DEFAULT_POOL_CAPACITY,
            pair_capacity: DEFAULT_PAIR_CAPACITY,
        }
    }
}

impl Config {
    /// Build a config from the environment
    ///
    /// Recognized variables: `PAIRCHAT_ADDR`, `PAIRCHAT_GRACE_SECS`,
    /// `PAIRCHAT_POOL_CAPACITY`, `PAIRCHAT_PAIR_CAPACITY`. Unparseable
    /// values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            addr: env::var("PAIRCHAT_ADDR").unwrap_or(defaults.addr),
            grace_period: env_parse("PAIRCHAT_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.grace_period),
            pool_capacity: env_parse("PAIRCHAT_POOL_CAPACITY").unwrap_or(defaults.pool_capacity),
            pair_capacity: env_parse("PAIRCHAT_PAIR_CAPACITY").unwrap_or(defaults.pair_capacity),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.grace_period, Duration::from_secs(DEFAULT_GRACE_SECS));
        assert_eq!(config.pool_capacity, DEFAULT_POOL_CAPACITY);
        assert_eq!(config.pair_capacity, DEFAULT_PAIR_CAPACITY);
    }
}
