//! Client-side aggregation of counters, gauges and sets.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use hashbrown::HashTable;
use parking_lot::Mutex;

use crate::config::AggregatorConfig;
use crate::message::{Context, Message};
use crate::telemetry::Telemetry;

/// A sharded table of in-flight aggregates.
///
/// Every metric identity maps to exactly one shard, so at most one aggregate per identity is
/// alive at any time. Shards are locked independently and a thread never holds more than one
/// shard lock.
pub struct Aggregator {
    shards: Box<[Mutex<HashTable<Message>>]>,
    hasher: RandomState,
    flush_interval: Option<Duration>,
    telemetry: Arc<Telemetry>,
}

impl Aggregator {
    /// Creates an aggregator. Aggregation is disabled if the config has no flush interval.
    pub fn new(config: &AggregatorConfig, telemetry: Arc<Telemetry>) -> Self {
        let flush_interval = config.flush_interval();
        let shards = match flush_interval {
            Some(_) => config.shards.max(1),
            None => 0,
        };

        Self {
            shards: (0..shards).map(|_| Mutex::new(HashTable::new())).collect(),
            hasher: RandomState::new(),
            flush_interval,
            telemetry,
        }
    }

    /// Returns `true` if messages are aggregated.
    pub fn is_enabled(&self) -> bool {
        self.flush_interval.is_some()
    }

    /// Returns the interval of the flush timer.
    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Absorbs a message into its aggregate.
    ///
    /// The first message of an identity becomes the aggregate, later messages are merged into
    /// it. Returns the message back if it cannot be aggregated: aggregation is disabled, the
    /// message type is not mergeable or the message is a flushed aggregate.
    pub fn try_aggregate(&self, message: Message) -> Result<(), Message> {
        if !self.is_enabled() || !message.can_aggregate() {
            return Err(message);
        }

        let Some(context) = message.context() else {
            return Err(message);
        };
        let hash = self.hash(&context);
        let shard = &self.shards[self.shard_index(hash)];

        let mut table = shard.lock();
        match table.find_mut(hash, |existing| existing.context() == Some(context)) {
            Some(existing) => {
                let Some(ty) = message.key().map(|key| key.ty) else {
                    return Err(message);
                };
                if let Err(error) = existing.merge(message) {
                    relay_log::error!(
                        error = &error as &dyn std::error::Error,
                        "failed to merge aggregate"
                    );
                    return Ok(());
                }
                self.telemetry.incr_aggregated_context(ty);
            }
            None => {
                table.insert_unique(hash, message, |entry| self.hash_entry(entry));
            }
        }

        Ok(())
    }

    /// Marks all aggregates as done and hands them to `sink`, emptying all shards.
    ///
    /// Shards are flushed one after another in index order. Returns the number of flushed
    /// aggregates.
    pub fn flush(&self, mut sink: impl FnMut(Message)) -> usize {
        let mut count = 0;

        for shard in self.shards.iter() {
            let mut table = shard.lock();
            count += table.len();
            for mut message in table.drain() {
                message.set_done();
                sink(message);
            }
        }

        count
    }

    /// Number of aggregates per shard.
    pub fn shard_sizes(&self) -> Vec<usize> {
        self.shards.iter().map(|shard| shard.lock().len()).collect()
    }

    /// Total number of aggregates in all shards.
    pub fn len(&self) -> usize {
        self.shard_sizes().into_iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hash(&self, context: &Context<'_>) -> u64 {
        self.hasher.hash_one(context)
    }

    fn hash_entry(&self, message: &Message) -> u64 {
        // Only messages with a context are ever inserted.
        message.context().map_or(0, |context| self.hash(&context))
    }

    fn shard_index(&self, hash: u64) -> usize {
        (hash % self.shards.len() as u64) as usize
    }
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("shards", &self.shards.len())
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use crate::format::LineFormat;
    use crate::message::{MetricKey, MetricOptions, MetricType, MetricValue, NumericMessage};

    use super::*;

    fn aggregator(shards: usize) -> Aggregator {
        let config = AggregatorConfig {
            shards,
            ..Default::default()
        };
        Aggregator::new(&config, Arc::new(Telemetry::new()))
    }

    fn flush_lines(aggregator: &Aggregator) -> Vec<String> {
        let format = LineFormat::default();
        let mut lines = Vec::new();
        aggregator.flush(|message| {
            assert!(message.is_done());
            let mut line = String::new();
            message.render(&mut line, &format).unwrap();
            lines.push(line);
        });
        lines.sort();
        lines
    }

    fn counter(name: &str, value: i64) -> Message {
        Message::numeric(MetricKey::new(name, MetricType::Counter), value)
    }

    #[test]
    fn test_counter_sum() {
        let aggregator = aggregator(4);
        for value in 0..10 {
            assert!(aggregator.try_aggregate(counter("count", value)).is_ok());
        }
        for _ in 0..10 {
            assert!(aggregator.try_aggregate(counter("count", 1)).is_ok());
        }

        assert_eq!(flush_lines(&aggregator), ["count:55|c"]);
        assert_eq!(aggregator.telemetry.snapshot().aggregated_context, 19);
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_gauge_last_write_wins() {
        let aggregator = aggregator(4);
        for value in 0..10 {
            let message = Message::numeric(MetricKey::new("gauge", MetricType::Gauge), value);
            assert!(aggregator.try_aggregate(message).is_ok());
        }

        assert_eq!(flush_lines(&aggregator), ["gauge:9|g"]);
        let snapshot = aggregator.telemetry.snapshot();
        assert_eq!(snapshot.aggregated_context_by_type(MetricType::Gauge), 9);
    }

    #[test]
    fn test_set_dedupe() {
        let aggregator = aggregator(4);
        for _ in 0..10 {
            let key = MetricKey::new("set", MetricType::Set);
            assert!(aggregator.try_aggregate(Message::set(key.clone(), "foo")).is_ok());
            assert!(aggregator.try_aggregate(Message::set(key, "bar")).is_ok());
        }

        assert_eq!(flush_lines(&aggregator), ["set:bar|s", "set:foo|s"]);
    }

    #[test]
    fn test_tag_order_same_aggregate() {
        let aggregator = aggregator(4);
        let mut a = MetricKey::new("count", MetricType::Counter);
        a.tags = ["x:1", "y:2"].into_iter().collect();
        let mut b = a.clone();
        b.tags = ["y:2", "x:1"].into_iter().collect();

        aggregator.try_aggregate(Message::numeric(a, 1)).unwrap();
        aggregator.try_aggregate(Message::numeric(b, 2)).unwrap();

        // The first message determines the rendered tag order.
        assert_eq!(flush_lines(&aggregator), ["count:3|c|#x:1,y:2"]);
    }

    #[test]
    fn test_declines_unaggregatable() {
        let aggregator = aggregator(4);

        for ty in [
            MetricType::Histogram,
            MetricType::Distribution,
            MetricType::Timing,
        ] {
            let message = Message::numeric(MetricKey::new("value", ty), 1);
            assert!(aggregator.try_aggregate(message).is_err());
        }

        let timestamped = Message::Numeric(NumericMessage {
            key: MetricKey::new("count", MetricType::Counter),
            value: MetricValue::Integer(1),
            options: MetricOptions {
                timestamp: Some(1_700_000_000),
                ..Default::default()
            },
        });
        assert!(aggregator.try_aggregate(timestamped).is_err());

        let mut done = counter("count", 1);
        done.set_done();
        assert!(aggregator.try_aggregate(done).is_err());

        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_disabled() {
        let config = AggregatorConfig {
            flush_interval: 0,
            ..Default::default()
        };
        let aggregator = Aggregator::new(&config, Arc::new(Telemetry::new()));
        assert!(!aggregator.is_enabled());
        assert_eq!(aggregator.shard_count(), 0);
        assert!(aggregator.try_aggregate(counter("count", 1)).is_err());
        assert_eq!(aggregator.flush(|_| panic!("nothing to flush")), 0);
    }

    #[test]
    fn test_flush_starts_new_window() {
        let aggregator = aggregator(2);
        aggregator.try_aggregate(counter("count", 1)).unwrap();
        assert_eq!(flush_lines(&aggregator), ["count:1|c"]);

        aggregator.try_aggregate(counter("count", 2)).unwrap();
        assert_eq!(flush_lines(&aggregator), ["count:2|c"]);
    }

    #[test]
    fn test_shard_balance() {
        let shards = 8;
        let contexts = 8000;
        let aggregator = aggregator(shards);

        for i in 0..contexts {
            aggregator
                .try_aggregate(counter(&format!("metric.{i}"), 1))
                .unwrap();
        }

        let sizes = aggregator.shard_sizes();
        assert_eq!(sizes.iter().sum::<usize>(), contexts);

        // Binomial distribution with n = 8000, p = 1/8 has a standard deviation of ~30. Allow
        // for more than six standard deviations.
        let expected = contexts / shards;
        for size in sizes {
            assert!(size.abs_diff(expected) < 200, "unbalanced shard: {size}");
        }
    }

    #[test]
    fn test_concurrent_aggregation() {
        let aggregator = Arc::new(aggregator(4));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let aggregator = Arc::clone(&aggregator);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        aggregator.try_aggregate(counter("count", 1)).unwrap();
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(flush_lines(&aggregator), ["count:4000|c"]);
    }

    /// Flushes all shards and sums the flushed counter values.
    fn flush_sum(aggregator: &Aggregator) -> i64 {
        let mut sum = 0;
        aggregator.flush(|message| match message {
            Message::Numeric(NumericMessage {
                value: MetricValue::Integer(value),
                ..
            }) => sum += value,
            other => panic!("unexpected aggregate {other:?}"),
        });
        sum
    }

    #[test]
    fn test_flush_concurrent_with_aggregation() {
        let aggregator = Arc::new(aggregator(4));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let aggregator = Arc::clone(&aggregator);
                std::thread::spawn(move || {
                    for i in 0..20_000 {
                        let name = format!("count.{}", i % 16);
                        aggregator.try_aggregate(counter(&name, 1)).unwrap();
                    }
                })
            })
            .collect();

        let mut total = 0;
        while !producers.iter().all(|producer| producer.is_finished()) {
            total += flush_sum(&aggregator);
        }

        for producer in producers {
            producer.join().unwrap();
        }
        total += flush_sum(&aggregator);

        // No increment is lost or counted twice, however the flushes interleave.
        assert_eq!(total, 80_000);
        assert!(aggregator.is_empty());
    }
}
