//! A DogStatsD client with client-side aggregation and packet batching.
//!
//! Recording a metric only builds a small message and pushes it onto a bounded queue. Everything
//! else happens on background threads:
//!
//! ```text
//! caller -> ingestion queue -> processor -> [aggregator] -> packet buffer -> sender -> transport
//! ```
//!
//! - The [`Processor`] renders messages into newline separated lines and packs them into
//!   buffers of at most one packet. Oversized lines are reported to the [`ErrorHandler`] and
//!   skipped.
//! - The [`Aggregator`] merges counters and gauges with the same identity and deduplicates set
//!   members. Aggregates are flushed periodically. Histograms, distributions and timings are
//!   never aggregated.
//! - The [`PacketSender`] writes filled buffers to the [`Transport`] and returns them to the
//!   [`BufferPool`], which bounds the memory of the pipeline.
//! - [`Telemetry`] counts what the client records, sends and drops, and reports these numbers as
//!   regular metrics.
//!
//! Delivery is best effort. Recording never fails and never blocks, unless blocking ingestion is
//! configured. Messages that cannot be delivered are dropped and counted instead.
//!
//! ## Usage
//!
//! ```no_run
//! use relay_dogstatsd::{ClientConfig, Event, StatsdClient};
//!
//! let config = ClientConfig {
//!     prefix: Some("myapp".to_owned()),
//!     constant_tags: vec!["env:prod".to_owned()],
//!     ..Default::default()
//! };
//!
//! let client = StatsdClient::connect(&config, "unixgram:///var/run/datadog/dsd.socket")?;
//!
//! client.increment("requests").tag("route:index").send();
//! client.set("users", "alice").send();
//! client.distribution_values("batch.latency", [1.5, 2.0, 3.25]).send();
//! client.event(Event::new("deploy", "finished"));
//!
//! client.close();
//! # Ok::<(), relay_dogstatsd::ClientError>(())
//! ```
//!
//! ## Testing
//!
//! With the `test` feature, [`CapturingTransport`] records all packets in memory:
//!
//! ```ignore
//! use relay_dogstatsd::{CapturingTransport, ClientConfig, StatsdClient};
//!
//! let transport = CapturingTransport::new(1432);
//! let client = StatsdClient::new(&ClientConfig::default(), transport.clone())?;
//! client.histogram("foo", 1).send();
//! client.close();
//!
//! assert_eq!(transport.lines(), ["foo:1|h"]);
//! ```

mod aggregator;
mod buffer;
mod client;
mod config;
mod error;
mod event;
mod format;
mod message;
mod processor;
mod sender;
mod telemetry;
mod timer;
pub mod transport;

pub use self::aggregator::*;
pub use self::buffer::*;
pub use self::client::*;
pub use self::config::*;
pub use self::error::*;
pub use self::event::*;
pub use self::format::LineFormat;
pub use self::message::*;
pub use self::processor::*;
pub use self::sender::*;
pub use self::telemetry::{Telemetry, TelemetrySnapshot};
pub use self::transport::Transport;
#[cfg(any(test, feature = "test"))]
pub use self::transport::{CapturingTransport, WriteBehavior};
