//! Broker configuration.

use std::str::FromStr;
use std::time::Duration;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind.
    pub bind: String,

    /// Port to bind.
    pub port: u16,

    /// Scan interval used while no client has negotiated a TTL.
    pub scan_interval: Duration,

    /// How often the status task samples the counters.
    pub status_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 61616,
            scan_interval: Duration::from_secs(1),
            status_interval: Duration::from_secs(2),
        }
    }
}

impl BrokerConfig {
    /// The endpoint string to bind the router socket on.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.bind, self.port)
    }

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RELAYBUS_BIND`: address to bind, default `0.0.0.0`
    /// - `RELAYBUS_PORT`: port to bind, default 61616
    /// - `RELAYBUS_SCAN_INTERVAL_MS`: fallback scan interval, default 1000
    /// - `RELAYBUS_STATUS_INTERVAL_SECS`: status sampling, default 2
    ///
    /// # Errors
    ///
    /// `ConfigError` when a value does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(bind) = std::env::var("RELAYBUS_BIND") {
            config.bind = bind;
        }
        config.port = parse_var("RELAYBUS_PORT", config.port)?;
        config.scan_interval =
            Duration::from_millis(parse_var("RELAYBUS_SCAN_INTERVAL_MS", 1000)?);
        config.status_interval =
            Duration::from_secs(parse_var("RELAYBUS_STATUS_INTERVAL_SECS", 2)?);

        Ok(config)
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            option: name,
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

/// Malformed configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An option value failed to parse
    #[error("invalid value for {option}: {value}")]
    InvalidValue {
        /// The option that failed.
        option: &'static str,
        /// The offending value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint() {
        let config = BrokerConfig::default();
        assert_eq!(config.endpoint(), "tcp://0.0.0.0:61616");
        assert_eq!(config.scan_interval, Duration::from_secs(1));
    }
}
