//! Writes filled packet buffers to the transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::buffer::{Buffer, BufferPool};
use crate::error::{ClientError, ErrorHandler, StatsdError};
use crate::telemetry::Telemetry;
use crate::transport::Transport;

/// Bounded wait for packets, after which workers check for an abort.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Shared {
    pool: Arc<BufferPool>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn ErrorHandler>,
    telemetry: Arc<Telemetry>,
    abort: AtomicBool,
}

impl Shared {
    /// Writes one packet. Failed packets are counted and discarded.
    fn send(&self, buffer: &Buffer) {
        let packet = buffer.as_bytes();

        let error = match self.transport.write(packet) {
            Ok(written) if written == packet.len() => {
                self.telemetry.incr_bytes_sent(packet.len() as u64);
                self.telemetry.incr_packets_sent(1);
                return;
            }
            Ok(written) => StatsdError::ShortWrite {
                written,
                expected: packet.len(),
            },
            Err(error) => StatsdError::Transport(error),
        };

        self.discard(buffer);
        self.handler.handle(error);
    }

    /// Counts a packet as dropped without writing it.
    fn discard(&self, buffer: &Buffer) {
        self.telemetry.incr_bytes_dropped(buffer.len() as u64);
        self.telemetry.incr_packets_dropped(1);
    }
}

/// A pool of threads draining the outbound channel.
pub struct PacketSender {
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl PacketSender {
    /// Starts `workers` threads reading packets from `outbound`.
    ///
    /// Every buffer is returned to `pool` after it has been written, regardless of the outcome.
    pub fn start(
        workers: usize,
        outbound: Receiver<Buffer>,
        pool: Arc<BufferPool>,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn ErrorHandler>,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self, ClientError> {
        let shared = Arc::new(Shared {
            pool,
            transport,
            handler,
            telemetry,
            abort: AtomicBool::new(false),
        });

        let mut sender = Self {
            workers: Vec::with_capacity(workers),
            shared,
        };

        for index in 0..workers.max(1) {
            let outbound = outbound.clone();
            let shared = Arc::clone(&sender.shared);

            let handle = thread::Builder::new()
                .name(format!("dogstatsd-sender-{index}"))
                .spawn(move || run(&outbound, &shared));

            match handle {
                Ok(handle) => sender.workers.push(handle),
                Err(error) => {
                    sender.shutdown(false);
                    return Err(ClientError::Spawn(error));
                }
            }
        }

        Ok(sender)
    }

    /// Stops all sender threads and waits for them to exit.
    ///
    /// A graceful shutdown returns once the outbound channel has been closed by all processor
    /// workers and every packet has been written. An abort discards pending packets.
    pub fn shutdown(&mut self, graceful: bool) {
        if !graceful {
            self.shared.abort.store(true, Ordering::Release);
        }

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                relay_log::error!("dogstatsd sender thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for PacketSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSender")
            .field("workers", &self.workers.len())
            .field("transport", &self.shared.transport.name())
            .finish()
    }
}

fn run(outbound: &Receiver<Buffer>, shared: &Shared) {
    loop {
        match outbound.recv_timeout(POLL_INTERVAL) {
            Ok(buffer) => {
                if shared.abort.load(Ordering::Acquire) {
                    shared.discard(&buffer);
                } else {
                    shared.send(&buffer);
                }
                shared.pool.release(buffer);
            }
            Err(RecvTimeoutError::Timeout) => {
                if shared.abort.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
