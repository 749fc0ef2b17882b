//! Ingestion and batching of messages into packets.
//!
//! The processor accepts messages from any number of recording threads through a bounded
//! ingestion queue. Worker threads take messages from the queue and either pass them to the
//! [`Aggregator`] or render them into the packet buffer they currently fill. Full buffers are
//! pushed to the outbound channel drained by the [`PacketSender`](crate::sender::PacketSender).
//!
//! Aggregates flushed by the aggregator re-enter the workers through a separate high priority
//! channel, which is always drained before the ingestion queue.
//!
//! Shutdown happens in phases:
//!  1. The ingestion queue is closed, so [`Processor::send`] rejects new messages.
//!  2. Workers drain all messages that were queued before.
//!  3. The aggregator is flushed one final time into the high priority channel, which is then
//!     closed.
//!  4. Workers drain the high priority channel, push their partially filled buffer and exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, select};
use parking_lot::Mutex;

use crate::aggregator::Aggregator;
use crate::buffer::{Buffer, BufferPool};
use crate::error::{ClientError, ErrorHandler, StatsdError};
use crate::format::LineFormat;
use crate::message::{Message, ValuesMessage};
use crate::telemetry::Telemetry;
use crate::timer::Timer;

/// Bounded wait of worker threads and blocked senders, after which they check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Parameters of the [`Processor`].
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Capacity of the ingestion queue.
    pub queue_size: usize,
    /// Blocks in [`Processor::send`] while the queue is full.
    pub blocking: bool,
    /// Number of worker threads.
    pub workers: usize,
}

/// Everything a worker thread needs, shared by all workers.
struct Shared {
    aggregator: Arc<Aggregator>,
    pool: Arc<BufferPool>,
    format: LineFormat,
    handler: Arc<dyn ErrorHandler>,
    telemetry: Arc<Telemetry>,
    abort: AtomicBool,
}

impl Shared {
    /// Counts a message that was accepted but will never be rendered.
    fn drop_message(&self) {
        self.telemetry.incr_packets_dropped_queue(1);
    }

    /// Counts the contents of a buffer that will never be sent.
    fn drop_buffer(&self, buffer: &Buffer) {
        if !buffer.is_empty() {
            self.telemetry.incr_bytes_dropped(buffer.len() as u64);
            self.telemetry.incr_packets_dropped(1);
        }
    }
}

/// The ingestion point of the pipeline.
pub struct Processor {
    ingress: ArcSwapOption<Sender<Message>>,
    /// Kept to count the messages left behind by an abort.
    ingress_rx: Receiver<Message>,
    high_priority_rx: Receiver<Message>,
    blocking: bool,
    closing: AtomicBool,
    high_priority: Mutex<Option<Sender<Message>>>,
    drained: Receiver<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    flush_timer: Mutex<Option<Timer>>,
    telemetry: Arc<Telemetry>,
    shared: Arc<Shared>,
}

impl Processor {
    /// Starts the worker threads and the aggregator flush timer.
    ///
    /// Workers push filled buffers into `outbound`. Once all workers have exited, the outbound
    /// channel disconnects.
    pub fn start(
        config: &ProcessorConfig,
        aggregator: Arc<Aggregator>,
        pool: Arc<BufferPool>,
        outbound: Sender<Buffer>,
        format: LineFormat,
        handler: Arc<dyn ErrorHandler>,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self, ClientError> {
        let (ingress_tx, ingress_rx) = crossbeam_channel::bounded(config.queue_size);
        let (high_tx, high_rx) = crossbeam_channel::unbounded();
        let (drained_tx, drained_rx) = crossbeam_channel::bounded(0);

        let shared = Arc::new(Shared {
            aggregator,
            pool,
            format,
            handler,
            telemetry: Arc::clone(&telemetry),
            abort: AtomicBool::new(false),
        });

        let processor = Self {
            ingress: ArcSwapOption::from_pointee(ingress_tx),
            ingress_rx: ingress_rx.clone(),
            high_priority_rx: high_rx.clone(),
            blocking: config.blocking,
            closing: AtomicBool::new(false),
            high_priority: Mutex::new(Some(high_tx.clone())),
            drained: drained_rx,
            workers: Mutex::new(Vec::with_capacity(config.workers)),
            flush_timer: Mutex::new(None),
            telemetry: Arc::clone(&telemetry),
            shared: Arc::clone(&shared),
        };

        for index in 0..config.workers.max(1) {
            let worker = Worker {
                ingress: ingress_rx.clone(),
                high_priority: high_rx.clone(),
                drained: Some(drained_tx.clone()),
                batcher: Batcher {
                    outbound: outbound.clone(),
                    shared: Arc::clone(&shared),
                    line: String::new(),
                    current: None,
                },
            };

            let handle = thread::Builder::new()
                .name(format!("dogstatsd-processor-{index}"))
                .spawn(move || worker.run());

            match handle {
                Ok(handle) => processor.workers.lock().push(handle),
                Err(error) => {
                    processor.shutdown(false);
                    return Err(ClientError::Spawn(error));
                }
            }
        }

        if let Some(interval) = shared.aggregator.flush_interval() {
            let aggregator = Arc::clone(&shared.aggregator);
            let timer = Timer::spawn("dogstatsd-aggregator", interval, move || {
                aggregator.flush(|message| {
                    if high_tx.send(message).is_err() {
                        telemetry.incr_packets_dropped_queue(1);
                    }
                });
            });

            match timer {
                Ok(timer) => *processor.flush_timer.lock() = Some(timer),
                Err(error) => {
                    processor.shutdown(false);
                    return Err(ClientError::Spawn(error));
                }
            }
        }

        Ok(processor)
    }

    /// Returns `true` if messages may be absorbed by the aggregator.
    pub fn aggregation_enabled(&self) -> bool {
        self.shared.aggregator.is_enabled()
    }

    /// Queues a message for processing.
    ///
    /// Returns `false` if the message was not accepted, either because the queue is full in
    /// non-blocking mode or because the processor is shutting down.
    pub fn send(&self, message: Message) -> bool {
        let Some(ingress) = self.ingress.load_full() else {
            return false;
        };

        if !self.blocking {
            return match ingress.try_send(message) {
                Ok(()) => true,
                Err(_) => {
                    self.telemetry.incr_packets_dropped_queue(1);
                    false
                }
            };
        }

        let mut message = message;
        while !self.closing.load(Ordering::Acquire) {
            match ingress.send_timeout(message, POLL_INTERVAL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(rejected)) => message = rejected,
                Err(SendTimeoutError::Disconnected(_)) => break,
            }
        }

        self.telemetry.incr_packets_dropped_queue(1);
        false
    }

    /// Stops the processor.
    ///
    /// A graceful shutdown processes all queued messages and the final aggregates before
    /// returning. An abort discards them and returns as soon as the workers noticed. Every
    /// discarded message and aggregate is counted as `packets_dropped_queue`.
    pub fn shutdown(&self, graceful: bool) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        // Stop intake. Blocked senders hold their own reference and give up on their next poll.
        self.ingress.store(None);

        let timer = self.flush_timer.lock().take();
        if let Some(timer) = timer {
            timer.stop();
        }

        if graceful {
            // Every worker drops its sender after draining the ingestion queue.
            let _ = self.drained.recv();

            if let Some(high_priority) = self.high_priority.lock().take() {
                self.shared.aggregator.flush(|message| {
                    if high_priority.send(message).is_err() {
                        self.telemetry.incr_packets_dropped_queue(1);
                    }
                });
            }
        } else {
            self.shared.abort.store(true, Ordering::Release);
            self.shared.pool.close();
            self.high_priority.lock().take();
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                relay_log::error!("dogstatsd processor thread panicked");
            }
        }

        if !graceful {
            self.discard_pending();
        }
    }

    /// Counts and drops everything still queued or aggregated after the workers exited.
    fn discard_pending(&self) {
        // Blocked senders give up on their next poll, after which the ingestion queue disconnects.
        let queued = self.ingress_rx.iter().count() + self.high_priority_rx.try_iter().count();
        let aggregates = self.shared.aggregator.flush(|_| ());

        if queued + aggregates > 0 {
            let dropped = (queued + aggregates) as u64;
            self.telemetry.incr_packets_dropped_queue(dropped);
            relay_log::debug!(queued, aggregates, "dogstatsd processor discarded messages");
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("blocking", &self.blocking)
            .field("closing", &self.closing)
            .field("aggregator", &self.shared.aggregator)
            .finish()
    }
}

/// A processor worker thread.
struct Worker {
    ingress: Receiver<Message>,
    high_priority: Receiver<Message>,
    drained: Option<Sender<()>>,
    batcher: Batcher,
}

impl Worker {
    fn run(mut self) {
        relay_log::debug!("dogstatsd processor started");

        while !self.batcher.aborted() {
            if let Ok(message) = self.high_priority.try_recv() {
                self.process(message);
                continue;
            }

            select! {
                recv(self.high_priority) -> message => {
                    // Only disconnects after the ingestion queue has been drained.
                    if let Ok(message) = message {
                        self.process(message);
                    }
                }
                recv(self.ingress) -> message => match message {
                    Ok(message) => self.process(message),
                    Err(_) => break,
                },
                default(POLL_INTERVAL) => self.batcher.push_current(),
            }
        }

        drop(self.drained.take());

        while !self.batcher.aborted() {
            match self.high_priority.recv_timeout(POLL_INTERVAL) {
                Ok(message) => self.process(message),
                Err(RecvTimeoutError::Timeout) => self.batcher.push_current(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.batcher.finish();
        relay_log::debug!("dogstatsd processor stopped");
    }

    fn process(&mut self, message: Message) {
        self.batcher.process(message);

        // Push partially filled buffers right away when there is no more work queued.
        if self.ingress.is_empty() && self.high_priority.is_empty() {
            self.batcher.push_current();
        }
    }
}

/// Renders messages into packet buffers, exclusively owning the buffer it fills.
struct Batcher {
    outbound: Sender<Buffer>,
    shared: Arc<Shared>,
    /// Scratch space for rendering lines, reused across messages.
    line: String,
    current: Option<Buffer>,
}

impl Batcher {
    fn aborted(&self) -> bool {
        self.shared.abort.load(Ordering::Acquire)
    }

    fn process(&mut self, message: Message) {
        let message = match self.shared.aggregator.try_aggregate(message) {
            Ok(()) => return,
            Err(message) => message,
        };

        if let Message::Values(ref values) = message {
            self.write_values(values);
        } else {
            self.line.clear();
            if message.render(&mut self.line, &self.shared.format).is_ok() {
                self.write_line();
            }
        }
    }

    /// Renders a multi-valued message into as many lines as needed.
    fn write_values(&mut self, message: &ValuesMessage) {
        let capacity = self.shared.pool.buffer_size();
        let mut offset = 0;

        while offset < message.values.len() {
            self.line.clear();
            match message.render_chunk(&mut self.line, &self.shared.format, offset, capacity) {
                Ok(next) => offset = next,
                Err(_) => return,
            }

            if !self.write_line() {
                return;
            }
        }
    }

    /// Appends the rendered line to the current buffer, rotating it if necessary.
    ///
    /// Returns `false` if the line was dropped.
    fn write_line(&mut self) -> bool {
        let capacity = self.shared.pool.buffer_size();
        let len = self.line.len();
        if len > capacity {
            self.shared.handler.handle(StatsdError::UnsendableMessage {
                size: len,
                capacity,
            });
            return false;
        }

        if self.current.as_ref().is_some_and(|buffer| !buffer.fits(len)) {
            self.push_current();
        }

        if self.current.is_none() {
            match self.shared.pool.acquire() {
                Ok(buffer) => self.current = Some(buffer),
                // The pool only closes when the pipeline is aborted.
                Err(_) => {
                    self.shared.drop_message();
                    return false;
                }
            }
        }

        match self.current {
            Some(ref mut buffer) => buffer.push_line(self.line.as_bytes()),
            None => false,
        }
    }

    /// Hands the current buffer to the sender.
    fn push_current(&mut self) {
        let Some(buffer) = self.current.take() else {
            return;
        };

        if buffer.is_empty() {
            self.shared.pool.release(buffer);
        } else if let Err(error) = self.outbound.send(buffer) {
            // The sender is gone, which only happens when the pipeline is aborted.
            let buffer = error.into_inner();
            self.shared.drop_buffer(&buffer);
            self.shared.pool.release(buffer);
        }
    }

    /// Pushes the last buffer, or returns it to the pool when aborting.
    fn finish(&mut self) {
        if !self.aborted() {
            self.push_current();
        } else if let Some(buffer) = self.current.take() {
            self.shared.drop_buffer(&buffer);
            self.shared.pool.release(buffer);
        }
    }
}
