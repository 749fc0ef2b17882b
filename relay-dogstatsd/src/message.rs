//! The message model of the pipeline.
//!
//! A [`Message`] is one emission from application code. Metric messages carry an identity in
//! their [`MetricKey`]: name, type, tags and cardinality. Messages with the same identity can be
//! merged by the [`Aggregator`](crate::Aggregator) while they are in flight.

use std::fmt::{self, Write};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::event::{Event, ServiceCheck};
use crate::format::{self, LineFormat};

/// The type of a metric, rendered after the value.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum MetricType {
    /// Counts instances of an event, summed within a flush window.
    Counter,
    /// Stores the latest observed value.
    Gauge,
    /// A duration in milliseconds.
    Timing,
    /// A value aggregated into a histogram by the agent.
    Histogram,
    /// A value aggregated into a global distribution by the backend.
    Distribution,
    /// Counts unique values.
    Set,
}

impl MetricType {
    /// All metric types, in rendering order of telemetry.
    pub const ALL: [Self; 6] = [
        Self::Counter,
        Self::Gauge,
        Self::Set,
        Self::Histogram,
        Self::Distribution,
        Self::Timing,
    ];

    /// Returns the type code rendered into the line protocol.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "c",
            Self::Gauge => "g",
            Self::Timing => "ms",
            Self::Histogram => "h",
            Self::Distribution => "d",
            Self::Set => "s",
        }
    }

    /// Returns the human readable name used in telemetry tags.
    pub fn name(self) -> &'static str {
        match self {
            Self::Counter => "count",
            Self::Gauge => "gauge",
            Self::Timing => "timing",
            Self::Histogram => "histogram",
            Self::Distribution => "distribution",
            Self::Set => "set",
        }
    }

    /// Returns `true` for types that are merged client-side.
    pub fn is_aggregatable(self) -> bool {
        matches!(self, Self::Counter | Self::Gauge | Self::Set)
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Counter => 0,
            Self::Gauge => 1,
            Self::Set => 2,
            Self::Histogram => 3,
            Self::Distribution => 4,
            Self::Timing => 5,
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controls how the agent enriches a metric with container tags.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    /// Leaves the decision to the agent. Not rendered.
    #[default]
    Default,
    /// No container tags.
    None,
    /// Low cardinality container tags.
    Low,
    /// Orchestrator level container tags, such as the pod name.
    Orchestrator,
    /// All container tags.
    High,
}

impl Cardinality {
    /// Returns the value of the `|card:` field, if it should be rendered.
    pub fn as_str(self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::None => Some("none"),
            Self::Low => Some("low"),
            Self::Orchestrator => Some("orchestrator"),
            Self::High => Some("high"),
        }
    }

    /// Returns `other` unless it is the default, in which case `self` is kept.
    pub(crate) fn or(self, other: Self) -> Self {
        match other {
            Self::Default => self,
            other => other,
        }
    }
}

/// A numeric accumulator value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue {
    /// An integral value, rendered without fraction.
    Integer(i64),
    /// A floating point value, rendered with up to six fractional digits.
    Float(f64),
}

impl MetricValue {
    /// Adds `other` to this value.
    ///
    /// The result takes the numeric type of the incoming value. Integer overflow saturates.
    pub fn add(&mut self, other: Self) {
        *self = match (*self, other) {
            (Self::Integer(a), Self::Integer(b)) => Self::Integer(a.saturating_add(b)),
            (a, Self::Float(b)) => Self::Float(a.as_f64() + b),
            (Self::Float(a), Self::Integer(b)) => Self::Integer((a + b as f64) as i64),
        };
    }

    /// Returns the value as floating point number.
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Integer(value) => value as f64,
            Self::Float(value) => value,
        }
    }

    fn render(self, out: &mut String) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(out, "{value}"),
            Self::Float(value) => format::write_float(out, value),
        }
    }
}

macro_rules! impl_from_value {
    ($variant:ident: $($ty:ty),*) => {
        $(
            impl From<$ty> for MetricValue {
                fn from(value: $ty) -> Self {
                    Self::$variant(value.into())
                }
            }
        )*
    };
}

impl_from_value!(Integer: i8, i16, i32, i64, u8, u16, u32);
impl_from_value!(Float: f32, f64);

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        Self::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for MetricValue {
    fn from(value: usize) -> Self {
        Self::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

/// Tags of a metric in the order they were supplied.
///
/// Equality and hashing disregard the order, so `a,b` and `b,a` belong to the same identity.
#[derive(Clone, Debug, Default)]
pub struct Tags(Vec<String>);

impl Tags {
    /// Creates an empty tag list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a tag.
    pub fn push(&mut self, tag: impl Into<String>) {
        self.0.push(tag.into());
    }

    /// Returns `true` if there are no tags.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of tags.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates the tags in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    fn sorted(&self) -> SmallVec<[&str; 8]> {
        let mut tags: SmallVec<[&str; 8]> = self.iter().collect();
        tags.sort_unstable();
        tags
    }
}

impl PartialEq for Tags {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && (self.0 == other.0 || self.sorted() == other.sorted())
    }
}

impl Eq for Tags {}

impl Hash for Tags {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sorted().hash(state);
    }
}

impl<S: Into<String>> FromIterator<S> for Tags {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>> Extend<S> for Tags {
    fn extend<T: IntoIterator<Item = S>>(&mut self, iter: T) {
        self.0.extend(iter.into_iter().map(Into::into));
    }
}

/// The identity of a metric.
///
/// The name already contains the client prefix.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct MetricKey {
    /// Full metric name.
    pub name: String,
    /// Type of the metric.
    pub ty: MetricType,
    /// Tags in insertion order.
    pub tags: Tags,
    /// Cardinality override.
    pub cardinality: Cardinality,
}

impl MetricKey {
    /// Creates a key without tags and with default cardinality.
    pub fn new(name: impl Into<String>, ty: MetricType) -> Self {
        Self {
            name: name.into(),
            ty,
            tags: Tags::new(),
            cardinality: Cardinality::Default,
        }
    }
}

/// Fields common to all metric messages.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricOptions {
    /// Explicit sample rate, rendered as `|@rate`.
    pub sample_rate: Option<f64>,
    /// Explicit unix timestamp in seconds, rendered as `|T<ts>`.
    pub timestamp: Option<u64>,
    /// Set once an aggregate has been flushed, so it is not aggregated again.
    pub done: bool,
}

/// A counter, gauge, timing, histogram or distribution with a single value.
#[derive(Clone, Debug, PartialEq)]
pub struct NumericMessage {
    pub key: MetricKey,
    pub value: MetricValue,
    pub options: MetricOptions,
}

/// A set with a single member.
#[derive(Clone, Debug, PartialEq)]
pub struct SetMessage {
    pub key: MetricKey,
    pub value: String,
    pub options: MetricOptions,
}

/// A distribution, histogram or timing carrying several values at once.
#[derive(Clone, Debug, PartialEq)]
pub struct ValuesMessage {
    pub key: MetricKey,
    pub values: Vec<MetricValue>,
    pub options: MetricOptions,
}

impl ValuesMessage {
    /// Renders a single line starting at value `offset`, holding as many values as fit into
    /// `capacity` bytes.
    ///
    /// Returns the offset of the first value that was not rendered. At least one value is always
    /// rendered, so the caller must check the length of the line against its capacity.
    pub fn render_chunk(
        &self,
        out: &mut String,
        format: &LineFormat,
        offset: usize,
        capacity: usize,
    ) -> Result<usize, fmt::Error> {
        let mut suffix = String::new();
        write_metadata(&mut suffix, &self.key, &self.options, format)?;

        let start = out.len();
        out.push_str(&self.key.name);

        let mut value = String::new();
        let mut end = offset;
        for &item in &self.values[offset..] {
            value.clear();
            value.push(':');
            item.render(&mut value)?;

            let len = out.len() - start + value.len() + suffix.len();
            if end > offset && len > capacity {
                break;
            }

            out.push_str(&value);
            end += 1;
        }

        out.push_str(&suffix);
        Ok(end)
    }
}

/// Borrowed identity of a message used for lookups in the aggregator.
///
/// Sets carry their member in the identity, so that every distinct member is kept once.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Context<'a> {
    key: &'a MetricKey,
    value: Option<&'a str>,
}

/// Error returned when merging two messages of incompatible types.
#[derive(Debug, thiserror::Error, PartialEq)]
#[error("found incompatible metric types")]
pub struct MergeError;

/// One emission in the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Numeric(NumericMessage),
    Set(SetMessage),
    Values(ValuesMessage),
    Event(Event),
    ServiceCheck(ServiceCheck),
}

impl Message {
    /// Creates a numeric message without options.
    pub fn numeric(key: MetricKey, value: impl Into<MetricValue>) -> Self {
        Self::Numeric(NumericMessage {
            key,
            value: value.into(),
            options: MetricOptions::default(),
        })
    }

    /// Creates a set message without options.
    pub fn set(key: MetricKey, value: impl Into<String>) -> Self {
        Self::Set(SetMessage {
            key,
            value: value.into(),
            options: MetricOptions::default(),
        })
    }

    /// Returns the metric identity, if this is a metric.
    pub fn key(&self) -> Option<&MetricKey> {
        match self {
            Self::Numeric(message) => Some(&message.key),
            Self::Set(message) => Some(&message.key),
            Self::Values(message) => Some(&message.key),
            Self::Event(_) | Self::ServiceCheck(_) => None,
        }
    }

    fn options(&self) -> Option<&MetricOptions> {
        match self {
            Self::Numeric(message) => Some(&message.options),
            Self::Set(message) => Some(&message.options),
            Self::Values(message) => Some(&message.options),
            Self::Event(_) | Self::ServiceCheck(_) => None,
        }
    }

    /// Returns `true` if this message is a finalized aggregate.
    pub fn is_done(&self) -> bool {
        self.options().is_some_and(|options| options.done)
    }

    /// Marks a metric as finalized. Has no effect on events and service checks.
    pub fn set_done(&mut self) {
        match self {
            Self::Numeric(message) => message.options.done = true,
            Self::Set(message) => message.options.done = true,
            Self::Values(message) => message.options.done = true,
            Self::Event(_) | Self::ServiceCheck(_) => (),
        }
    }

    /// Returns `true` if the aggregator may absorb this message.
    pub fn can_aggregate(&self) -> bool {
        !self.is_done() && self.context().is_some()
    }

    /// Returns the aggregation identity for messages that may be merged.
    ///
    /// Only counters, gauges and sets without explicit timestamp are mergeable.
    pub fn context(&self) -> Option<Context<'_>> {
        if self.options().is_none_or(|options| options.timestamp.is_some()) {
            return None;
        }

        match self {
            Self::Numeric(message) => match message.key.ty {
                MetricType::Counter | MetricType::Gauge => Some(Context {
                    key: &message.key,
                    value: None,
                }),
                _ => None,
            },
            Self::Set(message) => Some(Context {
                key: &message.key,
                value: Some(&message.value),
            }),
            _ => None,
        }
    }

    /// Merges a message of the same identity into this one.
    ///
    /// Counters are summed and gauges take the latest value. Sets are already deduplicated by
    /// their identity.
    pub fn merge(&mut self, other: Self) -> Result<(), MergeError> {
        debug_assert!(self.context() == other.context());

        match (self, other) {
            (Self::Numeric(this), Self::Numeric(other)) if this.key.ty == other.key.ty => {
                match this.key.ty {
                    MetricType::Counter => this.value.add(other.value),
                    MetricType::Gauge => this.value = other.value,
                    _ => return Err(MergeError),
                }
                Ok(())
            }
            (Self::Set(_), Self::Set(_)) => Ok(()),
            _ => Err(MergeError),
        }
    }

    /// Renders the wire line of this message without trailing newline.
    ///
    /// Multi-valued messages are rendered on a single line regardless of their length.
    pub fn render(&self, out: &mut String, format: &LineFormat) -> fmt::Result {
        match self {
            Self::Numeric(message) => {
                out.push_str(&message.key.name);
                out.push(':');
                message.value.render(out)?;
                write_metadata(out, &message.key, &message.options, format)
            }
            Self::Set(message) => {
                out.push_str(&message.key.name);
                out.push(':');
                out.push_str(&message.value);
                write_metadata(out, &message.key, &message.options, format)
            }
            Self::Values(message) => message
                .render_chunk(out, format, 0, usize::MAX)
                .map(drop),
            Self::Event(event) => event.render(out, format),
            Self::ServiceCheck(check) => check.render(out, format),
        }
    }
}

/// Writes everything following the values: type, rate, timestamp, tags and origin.
fn write_metadata(
    out: &mut String,
    key: &MetricKey,
    options: &MetricOptions,
    format: &LineFormat,
) -> fmt::Result {
    out.push('|');
    out.push_str(key.ty.as_str());

    if let Some(rate) = options.sample_rate {
        format::write_sample_rate(out, rate)?;
    }

    if let Some(timestamp) = options.timestamp {
        write!(out, "|T{timestamp}")?;
    }

    format.write_tags(out, key.tags.iter());
    format.write_origin(out, key.cardinality);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use similar_asserts::assert_eq;

    use super::*;

    fn render(message: &Message) -> String {
        let mut out = String::new();
        message.render(&mut out, &LineFormat::default()).unwrap();
        out
    }

    fn hash<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    fn key(name: &str, ty: MetricType, tags: &[&str]) -> MetricKey {
        MetricKey {
            name: name.to_owned(),
            ty,
            tags: tags.iter().copied().collect(),
            cardinality: Cardinality::Default,
        }
    }

    #[test]
    fn test_tags_order_independent_identity() {
        let a: Tags = ["b:2", "a:1"].into_iter().collect();
        let b: Tags = ["a:1", "b:2"].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(hash(&a), hash(&b));

        let c: Tags = ["a:1"].into_iter().collect();
        assert_ne!(a, c);
    }

    #[test]
    fn test_identity_includes_cardinality() {
        let mut a = key("foo", MetricType::Counter, &[]);
        let b = a.clone();
        a.cardinality = Cardinality::High;
        assert_ne!(a, b);
    }

    #[test]
    fn test_render_counter() {
        let mut message = Message::numeric(key("foo", MetricType::Counter, &["a:1", "b"]), 3);
        if let Message::Numeric(ref mut numeric) = message {
            numeric.options.sample_rate = Some(0.5);
        }
        assert_eq!(render(&message), "foo:3|c|@0.500000|#a:1,b");
    }

    #[test]
    fn test_render_gauge_float_with_timestamp() {
        let message = Message::Numeric(NumericMessage {
            key: key("foo", MetricType::Gauge, &[]),
            value: MetricValue::Float(1.25),
            options: MetricOptions {
                timestamp: Some(1_700_000_000),
                ..Default::default()
            },
        });
        assert_eq!(render(&message), "foo:1.25|g|T1700000000");
    }

    #[test]
    fn test_render_origin() {
        let mut metric = key("foo", MetricType::Distribution, &["a"]);
        metric.cardinality = Cardinality::Orchestrator;
        let message = Message::numeric(metric, f64::NAN);

        let format = LineFormat::new(["env:prod"], Some("cid".to_owned()));
        let mut out = String::new();
        message.render(&mut out, &format).unwrap();
        assert_eq!(out, "foo:NaN|d|#env:prod,a|c:cid|card:orchestrator");
    }

    #[test]
    fn test_render_set() {
        let message = Message::set(key("users", MetricType::Set, &[]), "alice");
        assert_eq!(render(&message), "users:alice|s");
    }

    #[test]
    fn test_render_values_chunked() {
        let message = ValuesMessage {
            key: key("dist", MetricType::Distribution, &[]),
            values: (1..=5).map(MetricValue::from).collect(),
            options: MetricOptions::default(),
        };

        let format = LineFormat::default();
        let mut lines = Vec::new();
        let mut offset = 0;
        while offset < message.values.len() {
            let mut out = String::new();
            offset = message.render_chunk(&mut out, &format, offset, 12).unwrap();
            lines.push(out);
        }

        assert_eq!(lines, ["dist:1:2:3|d", "dist:4:5|d"]);
    }

    #[test]
    fn test_render_values_chunk_renders_at_least_one() {
        let message = ValuesMessage {
            key: key("dist", MetricType::Distribution, &[]),
            values: vec![MetricValue::Integer(123456)],
            options: MetricOptions::default(),
        };

        let mut out = String::new();
        let end = message
            .render_chunk(&mut out, &LineFormat::default(), 0, 4)
            .unwrap();
        assert_eq!(end, 1);
        assert_eq!(out, "dist:123456|d");
    }

    #[test]
    fn test_merge_counter() {
        let mut a = Message::numeric(key("foo", MetricType::Counter, &[]), 2);
        let b = Message::numeric(key("foo", MetricType::Counter, &[]), 3);
        a.merge(b).unwrap();
        assert_eq!(render(&a), "foo:5|c");

        let c = Message::numeric(key("foo", MetricType::Counter, &[]), 0.5);
        a.merge(c).unwrap();
        assert_eq!(render(&a), "foo:5.5|c");
    }

    #[test]
    fn test_merge_gauge_last_write_wins() {
        let mut a = Message::numeric(key("foo", MetricType::Gauge, &[]), 2);
        let b = Message::numeric(key("foo", MetricType::Gauge, &[]), 1.5);
        a.merge(b).unwrap();
        assert_eq!(render(&a), "foo:1.5|g");
    }

    #[test]
    fn test_merge_incompatible() {
        let mut a = Message::numeric(key("foo", MetricType::Histogram, &[]), 2);
        let b = Message::numeric(key("foo", MetricType::Histogram, &[]), 3);
        assert_eq!(a.merge(b), Err(MergeError));
    }

    #[test]
    fn test_context() {
        let counter = Message::numeric(key("foo", MetricType::Counter, &[]), 1);
        assert!(counter.context().is_some());

        let histogram = Message::numeric(key("foo", MetricType::Histogram, &[]), 1);
        assert!(histogram.context().is_none());

        let foo = Message::set(key("k", MetricType::Set, &[]), "foo");
        let bar = Message::set(key("k", MetricType::Set, &[]), "bar");
        assert_ne!(foo.context(), bar.context());

        let timestamped = Message::Numeric(NumericMessage {
            key: key("foo", MetricType::Counter, &[]),
            value: MetricValue::Integer(1),
            options: MetricOptions {
                timestamp: Some(0),
                ..Default::default()
            },
        });
        assert!(timestamped.context().is_none());

        let mut done = counter.clone();
        done.set_done();
        assert!(counter.can_aggregate());
        assert!(!done.can_aggregate());
    }

    #[test]
    fn test_integer_overflow_saturates() {
        let mut value = MetricValue::Integer(i64::MAX);
        value.add(MetricValue::Integer(1));
        assert_eq!(value, MetricValue::Integer(i64::MAX));
    }
}
