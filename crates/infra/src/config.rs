//! Environment-driven configuration for both services.
//!
//! Every key has a default so a bare `cargo run` works against a local broker.
//! Values are read through a lookup function so tests never touch the process
//! environment.

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::workers::ApplierConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Where the log lives and which topic carries order events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub url: String,
    pub topic: String,
    /// Upper bound for opening a broker connection.
    pub connect_timeout: Duration,
    /// Pending deliveries idle this long are claimed by another consumer.
    pub claim_idle: Duration,
}

impl BrokerConfig {
    /// Dead-letter channel paired with the topic.
    pub fn dead_letter_topic(&self) -> String {
        format!("{}:dlq", self.topic)
    }

    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let connect_timeout = millis_or(lookup, "BROKER_CONNECT_TIMEOUT_MS", 5_000)?;
        if connect_timeout.is_zero() {
            return Err(invalid("BROKER_CONNECT_TIMEOUT_MS", "0", "must be at least 1"));
        }

        Ok(Self {
            url: string_or(lookup, "BROKER_URL", "redis://127.0.0.1:6379"),
            topic: string_or(lookup, "ORDERS_TOPIC", "orders"),
            connect_timeout,
            claim_idle: millis_or(lookup, "CONSUMER_CLAIM_IDLE_MS", 30_000)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandServiceConfig {
    pub listen_addr: SocketAddr,
    pub broker: BrokerConfig,
    pub publish_retry: RetryPolicy,
}

impl CommandServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let max_attempts: u32 = parse_or(&lookup, "PUBLISH_MAX_ATTEMPTS", 5)?;
        let base = millis_or(&lookup, "PUBLISH_BASE_DELAY_MS", 50)?;
        let max = millis_or(&lookup, "PUBLISH_MAX_DELAY_MS", 2_000)?;
        let timeout = millis_or(&lookup, "PUBLISH_TIMEOUT_MS", 10_000)?;

        if max_attempts == 0 {
            return Err(invalid("PUBLISH_MAX_ATTEMPTS", "0", "must be at least 1"));
        }

        Ok(Self {
            listen_addr: parse_or(&lookup, "COMMAND_LISTEN_ADDR", default_addr(8081))?,
            broker: BrokerConfig::from_lookup(&lookup)?,
            publish_retry: RetryPolicy::exponential(max_attempts, base, max).with_timeout(timeout),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryServiceConfig {
    pub listen_addr: SocketAddr,
    pub broker: BrokerConfig,
    pub applier: ApplierConfig,
}

impl QueryServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base = millis_or(&lookup, "CONSUMER_BASE_DELAY_MS", 200)?;
        let max = millis_or(&lookup, "CONSUMER_MAX_DELAY_MS", 10_000)?;
        let batch_size: usize = parse_or(&lookup, "CONSUMER_BATCH_SIZE", 32)?;
        let parallelism: usize = parse_or(&lookup, "APPLY_PARALLELISM", 4)?;

        if batch_size == 0 {
            return Err(invalid("CONSUMER_BATCH_SIZE", "0", "must be at least 1"));
        }
        if parallelism == 0 {
            return Err(invalid("APPLY_PARALLELISM", "0", "must be at least 1"));
        }

        let applier = ApplierConfig {
            group: string_or(&lookup, "CONSUMER_GROUP", "order-query-consumer"),
            consumer: string_or(&lookup, "CONSUMER_NAME", "order-query-1"),
            batch_size,
            poll_timeout: millis_or(&lookup, "CONSUMER_POLL_MS", 500)?,
            backoff: RetryPolicy::exponential(u32::MAX, base, max),
            degraded_after: parse_or(&lookup, "CONSUMER_DEGRADED_AFTER", 5)?,
            parallelism,
        };

        Ok(Self {
            listen_addr: parse_or(&lookup, "QUERY_LISTEN_ADDR", default_addr(8082))?,
            broker: BrokerConfig::from_lookup(&lookup)?,
            applier,
        })
    }
}

fn default_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn string_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, e.to_string())),
        _ => Ok(default),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse_or(lookup, key, default).map(Duration::from_millis)
}
