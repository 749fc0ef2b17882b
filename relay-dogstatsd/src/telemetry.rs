//! Self-instrumentation of the client.
//!
//! The pipeline counts what it records, sends and drops in a set of [`Telemetry`] counters. A
//! timer periodically takes the counters and submits them as counter metrics through the regular
//! ingestion path, so the numbers also reflect what happens to the telemetry itself.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::{Message, MetricKey, MetricType, Tags};

const PREFIX: &str = "datadog.dogstatsd.client.";

/// Atomic counters shared by all pipeline stages.
///
/// Increments use relaxed ordering. Counters are only ever read and reset by a single consumer.
#[derive(Debug, Default)]
pub struct Telemetry {
    metrics: AtomicU64,
    metrics_by_type: [AtomicU64; 6],
    events: AtomicU64,
    service_checks: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_dropped: AtomicU64,
    packets_sent: AtomicU64,
    packets_dropped: AtomicU64,
    packets_dropped_queue: AtomicU64,
    aggregated_context: AtomicU64,
    aggregated_context_by_type: [AtomicU64; 6],
}

macro_rules! counter_methods {
    ($($field:ident => $incr:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $incr(&self, value: u64) {
                self.$field.fetch_add(value, Ordering::Relaxed);
            }
        )*
    };
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    counter_methods! {
        events => incr_events,
        service_checks => incr_service_checks,
        bytes_sent => incr_bytes_sent,
        bytes_dropped => incr_bytes_dropped,
        packets_sent => incr_packets_sent,
        packets_dropped => incr_packets_dropped,
        packets_dropped_queue => incr_packets_dropped_queue,
    }

    /// Counts one recorded metric of the given type.
    pub fn incr_metrics(&self, ty: MetricType) {
        self.metrics.fetch_add(1, Ordering::Relaxed);
        self.metrics_by_type[ty.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one metric merged into an existing aggregate.
    pub fn incr_aggregated_context(&self, ty: MetricType) {
        self.aggregated_context.fetch_add(1, Ordering::Relaxed);
        self.aggregated_context_by_type[ty.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Reads all counters without resetting them.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.read(|counter| counter.load(Ordering::Relaxed))
    }

    /// Reads all counters and resets them to zero.
    pub fn take(&self) -> TelemetrySnapshot {
        self.read(|counter| counter.swap(0, Ordering::Relaxed))
    }

    fn read(&self, f: impl Fn(&AtomicU64) -> u64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            metrics: f(&self.metrics),
            metrics_by_type: self.metrics_by_type.each_ref().map(&f),
            events: f(&self.events),
            service_checks: f(&self.service_checks),
            bytes_sent: f(&self.bytes_sent),
            bytes_dropped: f(&self.bytes_dropped),
            packets_sent: f(&self.packets_sent),
            packets_dropped: f(&self.packets_dropped),
            packets_dropped_queue: f(&self.packets_dropped_queue),
            aggregated_context: f(&self.aggregated_context),
            aggregated_context_by_type: self.aggregated_context_by_type.each_ref().map(&f),
        }
    }
}

/// Values of the [`Telemetry`] counters at one point in time.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TelemetrySnapshot {
    pub metrics: u64,
    metrics_by_type: [u64; 6],
    pub events: u64,
    pub service_checks: u64,
    pub bytes_sent: u64,
    pub bytes_dropped: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub packets_dropped_queue: u64,
    pub aggregated_context: u64,
    aggregated_context_by_type: [u64; 6],
}

impl TelemetrySnapshot {
    /// Number of recorded metrics of the given type.
    pub fn metrics_by_type(&self, ty: MetricType) -> u64 {
        self.metrics_by_type[ty.index()]
    }

    /// Number of merged metrics of the given type.
    pub fn aggregated_context_by_type(&self, ty: MetricType) -> u64 {
        self.aggregated_context_by_type[ty.index()]
    }

    /// Converts the counters into counter messages carrying the given tags.
    pub fn into_messages(self, tags: &Tags) -> Vec<Message> {
        let counter = |name: &str, value: u64, extra: Option<String>| {
            let mut key = MetricKey::new(format!("{PREFIX}{name}"), MetricType::Counter);
            key.tags = tags.clone();
            key.tags.extend(extra);
            Message::numeric(key, value)
        };

        let mut messages = vec![
            counter("metrics", self.metrics, None),
            counter("events", self.events, None),
            counter("service_checks", self.service_checks, None),
            counter("bytes_sent", self.bytes_sent, None),
            counter("bytes_dropped", self.bytes_dropped, None),
            counter("packets_sent", self.packets_sent, None),
            counter("packets_dropped", self.packets_dropped, None),
            counter("packets_dropped_queue", self.packets_dropped_queue, None),
            counter("aggregated_context", self.aggregated_context, None),
        ];

        for ty in MetricType::ALL {
            let tag = format!("metrics_type:{}", ty.name());
            messages.push(counter(
                "metrics_by_type",
                self.metrics_by_type(ty),
                Some(tag.clone()),
            ));
            if ty.is_aggregatable() {
                messages.push(counter(
                    "aggregated_context_by_type",
                    self.aggregated_context_by_type(ty),
                    Some(tag),
                ));
            }
        }

        messages
    }
}

/// Returns the tags identifying this client on all telemetry metrics.
pub fn client_tags(transport: &str) -> Tags {
    [
        "client:rust".to_owned(),
        format!("client_version:{}", env!("CARGO_PKG_VERSION")),
        format!("client_transport:{transport}"),
    ]
    .into_iter()
    .collect()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use crate::format::LineFormat;

    use super::*;

    #[test]
    fn test_take_resets() {
        let telemetry = Telemetry::new();
        telemetry.incr_metrics(MetricType::Gauge);
        telemetry.incr_metrics(MetricType::Gauge);
        telemetry.incr_bytes_sent(100);

        let snapshot = telemetry.take();
        assert_eq!(snapshot.metrics, 2);
        assert_eq!(snapshot.metrics_by_type(MetricType::Gauge), 2);
        assert_eq!(snapshot.metrics_by_type(MetricType::Counter), 0);
        assert_eq!(snapshot.bytes_sent, 100);

        assert_eq!(telemetry.snapshot(), TelemetrySnapshot::default());
    }

    #[test]
    fn test_into_messages() {
        let telemetry = Telemetry::new();
        telemetry.incr_metrics(MetricType::Counter);
        telemetry.incr_aggregated_context(MetricType::Set);
        telemetry.incr_packets_dropped_queue(3);

        let tags = client_tags("udp");
        let format = LineFormat::default();
        let lines: Vec<String> = telemetry
            .take()
            .into_messages(&tags)
            .iter()
            .map(|message| {
                let mut out = String::new();
                message.render(&mut out, &format).unwrap();
                out.replace(env!("CARGO_PKG_VERSION"), "VERSION")
            })
            .collect();

        insta::assert_snapshot!(lines.join("\n"), @r"
        datadog.dogstatsd.client.metrics:1|c|#client:rust,client_version:VERSION,client_transport:udp
        datadog.dogstatsd.client.events:0|c|#client:rust,client_version:VERSION,client_transport:udp
        datadog.dogstatsd.client.service_checks:0|c|#client:rust,client_version:VERSION,client_transport:udp
        datadog.dogstatsd.client.bytes_sent:0|c|#client:rust,client_version:VERSION,client_transport:udp
        datadog.dogstatsd.client.bytes_dropped:0|c|#client:rust,client_version:VERSION,client_transport:udp
        datadog.dogstatsd.client.packets_sent:0|c|#client:rust,client_version:VERSION,client_transport:udp
        datadog.dogstatsd.client.packets_dropped:0|c|#client:rust,client_version:VERSION,client_transport:udp
        datadog.dogstatsd.client.packets_dropped_queue:3|c|#client:rust,client_version:VERSION,client_transport:udp
        datadog.dogstatsd.client.aggregated_context:1|c|#client:rust,client_version:VERSION,client_transport:udp
        datadog.dogstatsd.client.metrics_by_type:1|c|#client:rust,client_version:VERSION,client_transport:udp,metrics_type:count
        datadog.dogstatsd.client.aggregated_context_by_type:0|c|#client:rust,client_version:VERSION,client_transport:udp,metrics_type:count
        datadog.dogstatsd.client.metrics_by_type:0|c|#client:rust,client_version:VERSION,client_transport:udp,metrics_type:gauge
        datadog.dogstatsd.client.aggregated_context_by_type:0|c|#client:rust,client_version:VERSION,client_transport:udp,metrics_type:gauge
        datadog.dogstatsd.client.metrics_by_type:0|c|#client:rust,client_version:VERSION,client_transport:udp,metrics_type:set
        datadog.dogstatsd.client.aggregated_context_by_type:1|c|#client:rust,client_version:VERSION,client_transport:udp,metrics_type:set
        datadog.dogstatsd.client.metrics_by_type:0|c|#client:rust,client_version:VERSION,client_transport:udp,metrics_type:histogram
        datadog.dogstatsd.client.metrics_by_type:0|c|#client:rust,client_version:VERSION,client_transport:udp,metrics_type:distribution
        datadog.dogstatsd.client.metrics_by_type:0|c|#client:rust,client_version:VERSION,client_transport:udp,metrics_type:timing
        ");
    }
}
