use regex::Regex;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CdcError, Result};
use crate::services::cdc::FailurePolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub kafka: KafkaConfig,
    pub pipeline: PipelineConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Kafka brokers (comma-separated)
    pub brokers: String,
    pub client_id: String,
    /// Consumer group ID
    pub group_id: String,
    /// Subscription pattern, always `^`-anchored
    pub topic_pattern: String,
    pub start_from: StartPosition,
    pub session_timeout_ms: u32,
    /// Broker handshake attempts after the first one
    pub connect_max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bounded channel size in front of each partition task
    pub partition_buffer: usize,
    pub max_message_bytes: Option<usize>,
    pub commit_batch_size: usize,
    pub commit_interval: Duration,
    pub handler_max_retries: u32,
    pub handler_retry_backoff: Duration,
    pub failure_policy: FailurePolicy,
    /// How long a revocation or drain waits for in-flight dispatches
    pub rebalance_flush_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub http_port: u16,
    pub log_format: LogFormat,
}

/// Where a partition without a committed offset starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Beginning,
    Committed,
}

impl StartPosition {
    /// Value for librdkafka's `auto.offset.reset`
    pub fn auto_offset_reset(&self) -> &'static str {
        match self {
            StartPosition::Beginning => "earliest",
            StartPosition::Committed => "latest",
        }
    }
}

impl FromStr for StartPosition {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beginning" | "earliest" => Ok(StartPosition::Beginning),
            "committed" | "latest" => Ok(StartPosition::Committed),
            other => Err(CdcError::Config(format!(
                "unknown start position '{}' (expected 'beginning' or 'committed')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(CdcError::Config(format!("unknown log format '{}'", other))),
        }
    }
}

impl Config {
    /// Load configuration from the process environment (and `.env`, if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let topic_pattern = anchored_pattern(&string("CDC_TOPIC_PATTERN", r"^dbserver1\.public\..*"))?;

        let config = Config {
            kafka: KafkaConfig {
                brokers: string("KAFKA_BROKERS", "localhost:29092"),
                client_id: string("KAFKA_CLIENT_ID", "debezium-consumer"),
                group_id: string("CDC_CONSUMER_GROUP", "cdc-consumer-group"),
                topic_pattern,
                start_from: string("CDC_START_FROM", "beginning").parse()?,
                session_timeout_ms: parse(&lookup, "CDC_SESSION_TIMEOUT_MS", 30_000)?,
                connect_max_retries: parse(&lookup, "CDC_CONNECT_MAX_RETRIES", 5)?,
            },
            pipeline: PipelineConfig {
                partition_buffer: parse(&lookup, "CDC_PARTITION_BUFFER", 256)?,
                max_message_bytes: lookup("CDC_MAX_MESSAGE_BYTES")
                    .map(|raw| parse_value("CDC_MAX_MESSAGE_BYTES", &raw))
                    .transpose()?,
                commit_batch_size: parse(&lookup, "CDC_COMMIT_BATCH_SIZE", 100)?,
                commit_interval: Duration::from_millis(parse(
                    &lookup,
                    "CDC_COMMIT_INTERVAL_MS",
                    5_000,
                )?),
                handler_max_retries: parse(&lookup, "CDC_HANDLER_MAX_RETRIES", 3)?,
                handler_retry_backoff: Duration::from_millis(parse(
                    &lookup,
                    "CDC_HANDLER_RETRY_BACKOFF_MS",
                    200,
                )?),
                failure_policy: string("CDC_FAILURE_POLICY", "skip").parse()?,
                rebalance_flush_timeout: Duration::from_millis(parse(
                    &lookup,
                    "CDC_REBALANCE_FLUSH_TIMEOUT_MS",
                    30_000,
                )?),
            },
            service: ServiceConfig {
                http_port: parse(&lookup, "HTTP_PORT", 8080)?,
                log_format: string("LOG_FORMAT", "text").parse()?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.kafka.brokers.trim().is_empty() {
            return Err(CdcError::Config("KAFKA_BROKERS must not be empty".into()));
        }
        if self.pipeline.partition_buffer == 0 {
            return Err(CdcError::Config("CDC_PARTITION_BUFFER must be at least 1".into()));
        }
        if self.pipeline.commit_batch_size == 0 {
            return Err(CdcError::Config("CDC_COMMIT_BATCH_SIZE must be at least 1".into()));
        }
        if self.pipeline.max_message_bytes == Some(0) {
            return Err(CdcError::Config("CDC_MAX_MESSAGE_BYTES must be positive".into()));
        }
        Ok(())
    }
}

/// Validate a subscription pattern and anchor it with `^`.
///
/// librdkafka only treats `^`-prefixed subscriptions as regular expressions.
pub fn anchored_pattern(pattern: &str) -> Result<String> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(CdcError::Config("CDC_TOPIC_PATTERN must not be empty".into()));
    }
    let anchored = if pattern.starts_with('^') {
        pattern.to_string()
    } else {
        format!("^{}", pattern)
    };
    Regex::new(&anchored)
        .map_err(|e| CdcError::Config(format!("invalid CDC_TOPIC_PATTERN '{}': {}", pattern, e)))?;
    Ok(anchored)
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| CdcError::Config(format!("{} has invalid value '{}': {}", key, raw, e)))
}
