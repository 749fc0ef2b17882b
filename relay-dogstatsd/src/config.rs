use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::message::Cardinality;

/// Parameters of the client-side [`Aggregator`](crate::Aggregator).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Merges counters, gauges and sets on the client before sending them.
    ///
    /// Defaults to `true`.
    pub enabled: bool,

    /// The interval in milliseconds at which aggregates are flushed.
    ///
    /// Defaults to `2000` milliseconds. An interval of `0` disables aggregation.
    pub flush_interval: u64,

    /// Number of independently locked partitions of the aggregation table.
    ///
    /// Defaults to `4`. Higher values reduce lock contention between many recording threads.
    pub shards: usize,
}

impl AggregatorConfig {
    /// Returns the flush interval, or `None` if aggregation is disabled.
    pub fn flush_interval(&self) -> Option<Duration> {
        match self.flush_interval {
            0 => None,
            _ if !self.enabled => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval: 2000,
            shards: 4,
        }
    }
}

/// Parameters of the client's self-instrumentation.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Periodically reports `datadog.dogstatsd.client.*` metrics.
    ///
    /// Defaults to `true`.
    pub enabled: bool,

    /// The interval in milliseconds at which telemetry is reported.
    ///
    /// Defaults to `10000` milliseconds.
    pub flush_interval: u64,
}

impl TelemetryConfig {
    /// Returns the flush interval, or `None` if telemetry is disabled.
    pub fn flush_interval(&self) -> Option<Duration> {
        match self.flush_interval {
            0 => None,
            _ if !self.enabled => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval: 10_000,
        }
    }
}

/// Configuration of a [`StatsdClient`](crate::StatsdClient).
///
/// ```
/// use relay_dogstatsd::ClientConfig;
///
/// let config: ClientConfig = serde_json::from_str(r#"{
///     "prefix": "myapp",
///     "constant_tags": ["env:prod"],
///     "aggregator": {"flush_interval": 5000}
/// }"#).unwrap();
///
/// assert_eq!(config.aggregator.shards, 4);
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Prefix of all metric names and event titles, joined with a `.`.
    ///
    /// Defaults to `None`.
    pub prefix: Option<String>,

    /// Tags rendered on every metric, event and service check.
    pub constant_tags: Vec<String>,

    /// Container id sent as origin of every line.
    pub container_id: Option<String>,

    /// Cardinality used for messages that do not override it.
    pub cardinality: Cardinality,

    /// Capacity of the ingestion queue.
    ///
    /// Defaults to `4096` messages.
    pub queue_size: usize,

    /// Blocks recording threads while the ingestion queue is full.
    ///
    /// Defaults to `false`, in which case messages are dropped and counted.
    pub blocking: bool,

    /// Number of packet buffers.
    ///
    /// Defaults to `512`. Bounds the memory held by the pipeline together with the packet size.
    pub buffer_pool_size: usize,

    /// Maximum size of a packet in bytes.
    ///
    /// Defaults to `None`, in which case the transport decides: `1432` for UDP and `8192` for
    /// Unix datagram sockets.
    pub max_packet_size: Option<usize>,

    /// Number of threads serializing messages into packets.
    ///
    /// Defaults to `1`.
    pub processor_workers: usize,

    /// Number of threads writing packets to the transport.
    ///
    /// Defaults to `1`.
    pub sender_workers: usize,

    /// Client-side aggregation.
    pub aggregator: AggregatorConfig,

    /// Self-instrumentation.
    pub telemetry: TelemetryConfig,
}

impl ClientConfig {
    /// Checks that the configuration can be used to start a client.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.queue_size == 0 {
            return Err(ClientError::InvalidConfig("queue_size must be positive"));
        }
        if self.buffer_pool_size == 0 {
            return Err(ClientError::InvalidConfig(
                "buffer_pool_size must be positive",
            ));
        }
        if self.max_packet_size == Some(0) {
            return Err(ClientError::InvalidConfig("max_packet_size must be positive"));
        }
        if self.processor_workers == 0 {
            return Err(ClientError::InvalidConfig(
                "processor_workers must be positive",
            ));
        }
        if self.sender_workers == 0 {
            return Err(ClientError::InvalidConfig("sender_workers must be positive"));
        }
        if self.aggregator.flush_interval().is_some() && self.aggregator.shards == 0 {
            return Err(ClientError::InvalidConfig("aggregator shards must be positive"));
        }
        Ok(())
    }

    /// Returns the prefix including the trailing separator.
    pub(crate) fn name_prefix(&self) -> String {
        match self.prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{}.", prefix.trim_end_matches('.')),
            _ => String::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            constant_tags: Vec::new(),
            container_id: None,
            cardinality: Cardinality::Default,
            queue_size: 4096,
            blocking: false,
            buffer_pool_size: 512,
            max_packet_size: None,
            processor_workers: 1,
            sender_workers: 1,
            aggregator: AggregatorConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_defaults() {
        let config: ClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(
            config.aggregator.flush_interval(),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            config.telemetry.flush_interval(),
            Some(Duration::from_secs(10))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse() {
        let json = r#"{
            "prefix": "app",
            "cardinality": "orchestrator",
            "blocking": true,
            "max_packet_size": 8192,
            "aggregator": {"enabled": false},
            "telemetry": {"flush_interval": 0}
        }"#;

        let config: ClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cardinality, Cardinality::Orchestrator);
        assert_eq!(config.max_packet_size, Some(8192));
        assert!(config.blocking);
        assert_eq!(config.aggregator.flush_interval(), None);
        assert_eq!(config.aggregator.shards, 4);
        assert_eq!(config.telemetry.flush_interval(), None);
    }

    #[test]
    fn test_name_prefix() {
        let mut config = ClientConfig::default();
        assert_eq!(config.name_prefix(), "");

        config.prefix = Some("app".to_owned());
        assert_eq!(config.name_prefix(), "app.");

        config.prefix = Some("app.".to_owned());
        assert_eq!(config.name_prefix(), "app.");
    }

    #[test]
    fn test_validate() {
        let config = ClientConfig {
            sender_workers: 0,
            ..Default::default()
        };
        insta::assert_snapshot!(
            config.validate().unwrap_err().to_string(),
            @"invalid client configuration: sender_workers must be positive"
        );

        let config = ClientConfig {
            aggregator: AggregatorConfig {
                shards: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            aggregator: AggregatorConfig {
                enabled: false,
                shards: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
