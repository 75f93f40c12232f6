//! Client configuration.

use std::str::FromStr;
use std::time::Duration;

use url::Url;

const DEFAULT_PORT: u16 = 61616;

/// Configuration for one client session.
///
/// The process identity and pid are explicit fields here and flow into the
/// topic resolver; the session never reads ambient process state.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Node identity used in topic construction.
    pub identity: String,

    /// Process id used in the per-process reply topic.
    pub pid: u32,

    /// Broker host.
    pub broker_host: String,

    /// Broker port.
    pub broker_port: u16,

    /// Heartbeat interval negotiated with the broker at CONNECT.
    pub heartbeat: Duration,

    /// How long to wait for a command acknowledgement.
    pub ack_timeout: Duration,

    /// Pause before a heartbeat-triggered reconnect; also the backoff
    /// suggested by a transient receive failure.
    pub retry_pause: Duration,

    /// Topics subscribed as soon as the session first connects.
    pub subscriptions: Vec<String>,
}

impl ClientConfig {
    /// Configuration with defaults for everything but the identity and pid.
    #[must_use]
    pub fn new(identity: impl Into<String>, pid: u32) -> Self {
        Self {
            identity: identity.into(),
            pid,
            broker_host: "localhost".to_string(),
            broker_port: DEFAULT_PORT,
            heartbeat: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(5),
            retry_pause: Duration::from_millis(500),
            subscriptions: Vec::new(),
        }
    }

    /// The broker endpoint string.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.broker_host, self.broker_port)
    }

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RELAYBUS_IDENTITY`: node identity (required)
    /// - `RELAYBUS_BROKER`: broker URL, e.g. `tcp://broker:61616` (required)
    /// - `RELAYBUS_HEARTBEAT_SECS`: heartbeat interval, default 30
    /// - `RELAYBUS_ACK_TIMEOUT_MS`: acknowledgement wait, default 5000
    /// - `RELAYBUS_RETRY_PAUSE_MS`: reconnect pause, default 500
    /// - `RELAYBUS_SUBSCRIPTIONS`: JSON list of initial topics, default none
    ///
    /// # Errors
    ///
    /// `ConfigurationError` when a required variable is missing or a value
    /// does not parse.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let identity = required("RELAYBUS_IDENTITY")?;
        let broker = required("RELAYBUS_BROKER")?;
        let (broker_host, broker_port) = parse_broker_url(&broker)?;

        let heartbeat = Duration::from_secs(parse_var("RELAYBUS_HEARTBEAT_SECS", 30)?);
        let ack_timeout = Duration::from_millis(parse_var("RELAYBUS_ACK_TIMEOUT_MS", 5000)?);
        let retry_pause = Duration::from_millis(parse_var("RELAYBUS_RETRY_PAUSE_MS", 500)?);

        let subscriptions = match std::env::var("RELAYBUS_SUBSCRIPTIONS") {
            Ok(json) => serde_json::from_str(&json).map_err(|e| {
                ConfigurationError::InvalidValue {
                    option: "RELAYBUS_SUBSCRIPTIONS",
                    value: e.to_string(),
                }
            })?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            identity,
            pid: std::process::id(),
            broker_host,
            broker_port,
            heartbeat,
            ack_timeout,
            retry_pause,
            subscriptions,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigurationError> {
    std::env::var(name).map_err(|_| ConfigurationError::MissingOption(name))
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigurationError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigurationError::InvalidValue {
                option: name,
                value: raw,
            }),
        Err(_) => Ok(default),
    }
}

/// Parse a broker URL into host and port.
fn parse_broker_url(input: &str) -> Result<(String, u16), ConfigurationError> {
    let invalid = |detail: String| ConfigurationError::InvalidValue {
        option: "RELAYBUS_BROKER",
        value: detail,
    };

    if input.contains("://") {
        let url = Url::parse(input).map_err(|e| invalid(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" => {}
            scheme => {
                return Err(invalid(format!("{input}: unsupported scheme '{scheme}'")));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| invalid(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| invalid(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => DEFAULT_PORT,
        Some(port) => port
            .parse()
            .map_err(|_| invalid(format!("{input}: invalid port '{port}'")))?,
    };
    if parts.next().is_some() {
        return Err(invalid(format!("{input}: too many ':' separators")));
    }

    Ok((host.to_string(), port))
}

/// Missing or malformed configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigurationError {
    /// A required option was not provided
    #[error("missing required option {0}")]
    MissingOption(&'static str),
    /// An option value failed to parse
    #[error("invalid value for {option}: {value}")]
    InvalidValue {
        /// The option that failed.
        option: &'static str,
        /// What was wrong with it.
        value: String,
    },
}
