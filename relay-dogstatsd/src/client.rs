use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::distr::StandardUniform;

use crate::aggregator::Aggregator;
use crate::buffer::BufferPool;
use crate::config::ClientConfig;
use crate::error::{ClientError, ErrorHandler, LogErrorHandler, StatsdError};
use crate::event::{Event, ServiceCheck};
use crate::format::LineFormat;
use crate::message::{
    Cardinality, Message, MetricKey, MetricOptions, MetricType, MetricValue, NumericMessage,
    SetMessage, Tags, ValuesMessage,
};
use crate::processor::{Processor, ProcessorConfig};
use crate::sender::PacketSender;
use crate::telemetry::{self, Telemetry, TelemetrySnapshot};
use crate::timer::Timer;
use crate::transport::{self, Transport};

/// A DogStatsD client.
///
/// Recording never blocks, unless blocking ingestion is configured, and never fails. Messages
/// that cannot be delivered are dropped and counted in the client's telemetry.
///
/// ```no_run
/// use relay_dogstatsd::{ClientConfig, StatsdClient};
///
/// let client = StatsdClient::connect(&ClientConfig::default(), "udp://127.0.0.1:8125").unwrap();
///
/// client.increment("requests").tag("route:index").send();
/// client.gauge("queue.size", 42).send();
/// client.distribution("latency", 12.5).sample_rate(0.5).send();
///
/// // Flushes all pending metrics.
/// client.close();
/// ```
pub struct StatsdClient {
    prefix: String,
    cardinality: Cardinality,
    processor: Arc<Processor>,
    sender: PacketSender,
    telemetry_timer: Option<Timer>,
    telemetry: Arc<Telemetry>,
    pool: Arc<BufferPool>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn ErrorHandler>,
    closed: bool,
}

impl StatsdClient {
    /// Creates a client writing to the given transport and logging errors.
    pub fn new<T>(config: &ClientConfig, transport: T) -> Result<Self, ClientError>
    where
        T: Transport + 'static,
    {
        Self::with_error_handler(config, transport, Arc::new(LogErrorHandler))
    }

    /// Creates a client connected to an agent address.
    ///
    /// See [`transport::connect`] for supported addresses.
    pub fn connect(config: &ClientConfig, addr: &str) -> Result<Self, ClientError> {
        let transport = transport::connect(addr).map_err(ClientError::Connect)?;
        Self::new(config, transport)
    }

    /// Creates a client with a custom error handler.
    pub fn with_error_handler<T>(
        config: &ClientConfig,
        transport: T,
        handler: Arc<dyn ErrorHandler>,
    ) -> Result<Self, ClientError>
    where
        T: Transport + 'static,
    {
        config.validate()?;

        let transport: Arc<dyn Transport> = Arc::new(transport);
        let packet_size = config
            .max_packet_size
            .unwrap_or_else(|| transport.max_packet_size());

        let telemetry = Arc::new(Telemetry::new());
        let pool = Arc::new(BufferPool::new(config.buffer_pool_size, packet_size));
        let (outbound_tx, outbound_rx) = crossbeam_channel::bounded(config.buffer_pool_size);

        let mut sender = PacketSender::start(
            config.sender_workers,
            outbound_rx,
            Arc::clone(&pool),
            Arc::clone(&transport),
            Arc::clone(&handler),
            Arc::clone(&telemetry),
        )?;

        let processor = Processor::start(
            &ProcessorConfig {
                queue_size: config.queue_size,
                blocking: config.blocking,
                workers: config.processor_workers,
            },
            Arc::new(Aggregator::new(&config.aggregator, Arc::clone(&telemetry))),
            Arc::clone(&pool),
            outbound_tx,
            LineFormat::new(&config.constant_tags, config.container_id.clone()),
            Arc::clone(&handler),
            Arc::clone(&telemetry),
        );

        let processor = match processor {
            Ok(processor) => Arc::new(processor),
            Err(error) => {
                sender.shutdown(false);
                return Err(error);
            }
        };

        let mut client = Self {
            prefix: config.name_prefix(),
            cardinality: config.cardinality,
            processor,
            sender,
            telemetry_timer: None,
            telemetry,
            pool,
            transport,
            handler,
            closed: false,
        };

        if let Some(interval) = config.telemetry.flush_interval() {
            match client.spawn_telemetry(interval) {
                Ok(timer) => client.telemetry_timer = Some(timer),
                Err(error) => {
                    client.shutdown(false);
                    return Err(ClientError::Spawn(error));
                }
            }
        }

        relay_log::debug!(
            transport = client.transport.name(),
            packet_size,
            "dogstatsd client started"
        );

        Ok(client)
    }

    fn spawn_telemetry(&self, interval: Duration) -> std::io::Result<Timer> {
        let processor = Arc::clone(&self.processor);
        let telemetry = Arc::clone(&self.telemetry);
        let tags = telemetry::client_tags(self.transport.name());

        Timer::spawn("dogstatsd-telemetry", interval, move || {
            for message in telemetry.take().into_messages(&tags) {
                processor.send(message);
            }
        })
    }

    /// Adds `value` to a counter.
    pub fn count(&self, name: &str, value: impl Into<MetricValue>) -> MetricBuilder<'_> {
        MetricBuilder::numeric(self, name, MetricType::Counter, value.into())
    }

    /// Increments a counter by one.
    pub fn increment(&self, name: &str) -> MetricBuilder<'_> {
        self.count(name, 1)
    }

    /// Decrements a counter by one.
    pub fn decrement(&self, name: &str) -> MetricBuilder<'_> {
        self.count(name, -1)
    }

    /// Sets a gauge to the latest value.
    pub fn gauge(&self, name: &str, value: impl Into<MetricValue>) -> MetricBuilder<'_> {
        MetricBuilder::numeric(self, name, MetricType::Gauge, value.into())
    }

    /// Records a timing in milliseconds.
    pub fn time(&self, name: &str, millis: impl Into<MetricValue>) -> MetricBuilder<'_> {
        MetricBuilder::numeric(self, name, MetricType::Timing, millis.into())
    }

    /// Records a duration as timing with sub-millisecond precision.
    pub fn time_duration(&self, name: &str, duration: Duration) -> MetricBuilder<'_> {
        let millis = duration.as_nanos() as f64 / 1e6;
        self.time(name, millis)
    }

    pub fn histogram(&self, name: &str, value: impl Into<MetricValue>) -> MetricBuilder<'_> {
        MetricBuilder::numeric(self, name, MetricType::Histogram, value.into())
    }

    pub fn distribution(&self, name: &str, value: impl Into<MetricValue>) -> MetricBuilder<'_> {
        MetricBuilder::numeric(self, name, MetricType::Distribution, value.into())
    }

    /// Records many distribution values in one message.
    ///
    /// The values are split over several lines if they do not fit into a single packet. Without
    /// values, nothing is recorded and `send` returns `false`.
    pub fn distribution_values<I>(&self, name: &str, values: I) -> MetricBuilder<'_>
    where
        I: IntoIterator,
        I::Item: Into<MetricValue>,
    {
        let values: Vec<MetricValue> = values.into_iter().map(Into::into).collect();
        MetricBuilder::new(self, name, MetricType::Distribution, Value::Values(values))
    }

    /// Adds a member to a set.
    pub fn set(&self, name: &str, value: impl Into<String>) -> MetricBuilder<'_> {
        MetricBuilder::new(self, name, MetricType::Set, Value::Set(value.into()))
    }

    /// Posts an event. The client prefix is prepended to the title.
    pub fn event(&self, mut event: Event) -> bool {
        event.title.insert_str(0, &self.prefix);
        event.default_cardinality(self.cardinality);

        self.telemetry.incr_events(1);
        self.processor.send(Message::Event(event))
    }

    /// Reports the status of a service check.
    pub fn service_check(&self, mut check: ServiceCheck) -> bool {
        check.default_cardinality(self.cardinality);

        self.telemetry.incr_service_checks(1);
        self.processor.send(Message::ServiceCheck(check))
    }

    /// Returns the current values of the telemetry counters.
    ///
    /// Counters are reset whenever telemetry is reported.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Flushes all pending messages and aggregates, then closes the transport.
    ///
    /// Blocks until everything has been written.
    pub fn close(mut self) {
        self.shutdown(true);
    }

    /// Stops the client without delivering pending messages.
    pub fn abort(mut self) {
        self.shutdown(false);
    }

    fn shutdown(&mut self, graceful: bool) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(timer) = self.telemetry_timer.take() {
            timer.stop();
        }

        self.processor.shutdown(graceful);
        self.sender.shutdown(graceful);
        self.pool.close();

        if let Err(error) = self.transport.close() {
            self.handler.handle(StatsdError::Close(error));
        }

        relay_log::debug!(graceful, "dogstatsd client stopped");
    }

    fn submit(&self, builder: MetricBuilder<'_>) -> bool {
        let MetricBuilder {
            name,
            ty,
            value,
            tags,
            sample_rate,
            timestamp,
            cardinality,
            ..
        } = builder;

        // A line needs at least one value.
        if matches!(&value, Value::Values(values) if values.is_empty()) {
            return false;
        }

        let aggregated = self.processor.aggregation_enabled()
            && ty.is_aggregatable()
            && timestamp.is_none()
            && !matches!(value, Value::Values(_));

        // Aggregated messages are always captured and carry no sample rate.
        let sample_rate = if aggregated { None } else { sample_rate };
        if let Some(rate) = sample_rate {
            if !should_send(rate) {
                return false;
            }
        }

        let key = MetricKey {
            name,
            ty,
            tags,
            cardinality: self.cardinality.or(cardinality),
        };
        let options = MetricOptions {
            sample_rate,
            timestamp,
            done: false,
        };

        let message = match value {
            Value::Numeric(value) => Message::Numeric(NumericMessage {
                key,
                value,
                options,
            }),
            Value::Set(value) => Message::Set(SetMessage {
                key,
                value,
                options,
            }),
            Value::Values(values) => Message::Values(ValuesMessage {
                key,
                values,
                options,
            }),
        };

        self.telemetry.incr_metrics(ty);
        self.processor.send(message)
    }
}

impl Drop for StatsdClient {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

impl std::fmt::Debug for StatsdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsdClient")
            .field("prefix", &self.prefix)
            .field("processor", &self.processor)
            .field("sender", &self.sender)
            .field("closed", &self.closed)
            .finish()
    }
}

fn should_send(sample_rate: f64) -> bool {
    if sample_rate <= 0.0 {
        false
    } else if sample_rate >= 1.0 {
        true
    } else {
        let mut rng = rand::rng();
        let s: f64 = rng.sample(StandardUniform);
        s <= sample_rate
    }
}

enum Value {
    Numeric(MetricValue),
    Set(String),
    Values(Vec<MetricValue>),
}

/// A metric being recorded.
///
/// Created by the recording methods of [`StatsdClient`]. Nothing is recorded until
/// [`send`](Self::send) is called.
#[must_use = "metrics are only recorded once `send` is called"]
pub struct MetricBuilder<'a> {
    client: &'a StatsdClient,
    name: String,
    ty: MetricType,
    value: Value,
    tags: Tags,
    sample_rate: Option<f64>,
    timestamp: Option<u64>,
    cardinality: Cardinality,
}

impl<'a> MetricBuilder<'a> {
    fn new(client: &'a StatsdClient, name: &str, ty: MetricType, value: Value) -> Self {
        Self {
            client,
            name: format!("{}{name}", client.prefix),
            ty,
            value,
            tags: Tags::new(),
            sample_rate: None,
            timestamp: None,
            cardinality: Cardinality::Default,
        }
    }

    fn numeric(client: &'a StatsdClient, name: &str, ty: MetricType, value: MetricValue) -> Self {
        Self::new(client, name, ty, Value::Numeric(value))
    }

    /// Appends a tag, such as `env:prod`.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag);
        self
    }

    /// Appends a `key:value` tag.
    pub fn with_tag(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        self.tags.push(format!("{key}:{value}"));
        self
    }

    /// Appends several tags.
    pub fn tags<I>(mut self, tags: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.tags.extend(tags);
        self
    }

    /// Samples the metric at the given rate between `0` and `1`.
    ///
    /// Ignored for counters, gauges and sets while aggregation is enabled.
    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = (!rate.is_nan() && rate < 1.0).then(|| rate.max(0.0));
        self
    }

    /// Sets an explicit unix timestamp in seconds. Timestamped metrics are never aggregated.
    pub fn timestamp(mut self, secs: u64) -> Self {
        self.timestamp = Some(secs);
        self
    }

    /// Overrides the cardinality configured on the client.
    pub fn cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    /// Records the metric.
    ///
    /// Returns `false` if the metric was sampled out or dropped because the client is
    /// overloaded or closed.
    pub fn send(self) -> bool {
        self.client.submit(self)
    }
}
