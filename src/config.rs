//! Server configuration module
//! Handles dynamic configuration parameters for the signaling relay

use crate::constants::{
    DEFAULT_HOST, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_OUTBOUND_QUEUE_SIZE, DEFAULT_PING_INTERVAL_SECS, DEFAULT_PORT,
    DEFAULT_SHUTDOWN_GRACE_SECS, DEFAULT_WRITE_TIMEOUT_SECS,
};
use crate::error::{Result, SignalError};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Where the upstream identity collaborator places the resolved user identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// `?user_id=...` on the upgrade request
    Query,
    /// `x-user-id` header set by an authenticating proxy
    Header,
}

impl FromStr for IdentitySource {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "query" => Ok(Self::Query),
            "header" => Ok(Self::Header),
            other => Err(SignalError::ConfigError(format!(
                "Unknown identity source '{}', expected 'query' or 'header'",
                other
            ))),
        }
    }
}

/// What to do when a second connection resolves to an identity that is already connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Close the existing session and keep the new one
    Replace,
    /// Refuse the new connection
    Reject,
}

impl FromStr for DuplicatePolicy {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "reject" => Ok(Self::Reject),
            other => Err(SignalError::ConfigError(format!(
                "Unknown duplicate session policy '{}', expected 'replace' or 'reject'",
                other
            ))),
        }
    }
}

/// Server configuration parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of each session's outbound queue
    pub outbound_queue_size: usize,
    /// Largest inbound frame accepted by the transport
    pub max_message_size: usize,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    /// Teardown after this long without any inbound frame
    pub idle_timeout: Duration,
    /// How long shutdown waits for session pumps to finish
    pub shutdown_grace: Duration,
    pub identity_source: IdentitySource,
    pub duplicate_policy: DuplicatePolicy,
}

impl ServerConfig {
    /// Deterministic configuration for tests
    pub fn for_testing() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            outbound_queue_size: 16,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            write_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(1),
            identity_source: IdentitySource::Query,
            duplicate_policy: DuplicatePolicy::Replace,
        }
    }

    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("RUSTY_SIGNAL_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = parse_or(&lookup, "RUSTY_SIGNAL_PORT", DEFAULT_PORT)?;

        let outbound_queue_size = parse_or(
            &lookup,
            "RUSTY_SIGNAL_OUTBOUND_QUEUE",
            DEFAULT_OUTBOUND_QUEUE_SIZE,
        )?;
        let max_message_size = parse_or(
            &lookup,
            "RUSTY_SIGNAL_MAX_MESSAGE_SIZE",
            DEFAULT_MAX_MESSAGE_SIZE,
        )?;

        let write_timeout_secs = parse_or(
            &lookup,
            "RUSTY_SIGNAL_WRITE_TIMEOUT",
            DEFAULT_WRITE_TIMEOUT_SECS,
        )?;
        let ping_secs = parse_or(
            &lookup,
            "RUSTY_SIGNAL_PING_INTERVAL",
            DEFAULT_PING_INTERVAL_SECS,
        )?;
        let idle_secs = parse_or(
            &lookup,
            "RUSTY_SIGNAL_IDLE_TIMEOUT",
            DEFAULT_IDLE_TIMEOUT_SECS,
        )?;
        let grace_secs = parse_or(
            &lookup,
            "RUSTY_SIGNAL_SHUTDOWN_GRACE",
            DEFAULT_SHUTDOWN_GRACE_SECS,
        )?;

        let identity_source = match lookup("RUSTY_SIGNAL_IDENTITY_SOURCE") {
            Some(value) => value.parse()?,
            None => IdentitySource::Query,
        };
        let duplicate_policy = match lookup("RUSTY_SIGNAL_DUPLICATE_POLICY") {
            Some(value) => value.parse()?,
            None => DuplicatePolicy::Replace,
        };

        let config = Self {
            host,
            port,
            outbound_queue_size,
            max_message_size,
            write_timeout: Duration::from_secs(write_timeout_secs),
            ping_interval: Duration::from_secs(ping_secs),
            idle_timeout: Duration::from_secs(idle_secs),
            shutdown_grace: Duration::from_secs(grace_secs),
            identity_source,
            duplicate_policy,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the session pumps cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.outbound_queue_size == 0 {
            return Err(SignalError::ConfigError(
                "RUSTY_SIGNAL_OUTBOUND_QUEUE must be greater than zero".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(SignalError::ConfigError(
                "RUSTY_SIGNAL_MAX_MESSAGE_SIZE must be greater than zero".to_string(),
            ));
        }
        if self.write_timeout.is_zero() || self.ping_interval.is_zero() {
            return Err(SignalError::ConfigError(
                "Write timeout and ping interval must be greater than zero".to_string(),
            ));
        }
        // Pongs are the only traffic from an idle client
        if self.idle_timeout <= self.ping_interval {
            return Err(SignalError::ConfigError(format!(
                "Idle timeout ({}s) must be longer than the ping interval ({}s)",
                self.idle_timeout.as_secs(),
                self.ping_interval.as_secs()
            )));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            SignalError::ConfigError(format!("{} has an invalid value: '{}'", key, raw))
        }),
        None => Ok(default),
    }
}
