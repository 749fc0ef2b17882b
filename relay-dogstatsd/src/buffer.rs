//! Reusable packet buffers.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::Mutex;

/// Separator between lines in a packet.
const SEPARATOR: u8 = b'\n';

/// A fixed capacity packet buffer filled with newline separated lines.
///
/// A buffer is owned by exactly one thread at a time and moves between the pool, the processor
/// which fills it and the sender which writes it out.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    capacity: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns the contents of the buffer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the maximum packet size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` if a line of `len` bytes plus its separator fits into the buffer.
    pub fn fits(&self, len: usize) -> bool {
        let separator = usize::from(!self.data.is_empty());
        self.data.len() + separator + len <= self.capacity
    }

    /// Appends a line, separating it from the previous line if there is one.
    ///
    /// Returns `false` without modifying the buffer if the line does not fit.
    pub fn push_line(&mut self, line: &[u8]) -> bool {
        if !self.fits(line.len()) {
            return false;
        }

        if !self.data.is_empty() {
            self.data.push(SEPARATOR);
        }
        self.data.extend_from_slice(line);
        true
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Error returned from [`BufferPool::acquire`] after the pool was closed.
#[derive(Debug, thiserror::Error)]
#[error("buffer pool is closed")]
pub struct PoolClosed;

/// A fixed set of buffers handed out and returned by the pipeline.
///
/// The pool bounds the total memory of the pipeline. All buffers are allocated when the pool is
/// created and are never freed until the pool itself is dropped.
#[derive(Debug)]
pub struct BufferPool {
    tx: Sender<Buffer>,
    rx: Receiver<Buffer>,
    buffer_size: usize,
    size: usize,
    closed: AtomicBool,
    /// Dropped on close, which disconnects `close_rx` and wakes all waiters.
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl BufferPool {
    /// Creates a pool of `size` buffers with `buffer_size` bytes of capacity each.
    pub fn new(size: usize, buffer_size: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(size);
        let (close_tx, close_rx) = crossbeam_channel::bounded(0);
        for _ in 0..size {
            // The channel has room for exactly `size` buffers and the receiver is alive.
            let _ = tx.try_send(Buffer::new(buffer_size));
        }

        Self {
            tx,
            rx,
            buffer_size,
            size,
            closed: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        }
    }

    /// Takes a buffer from the pool, waiting until one becomes available.
    ///
    /// Fails only once the pool has been closed.
    pub fn acquire(&self) -> Result<Buffer, PoolClosed> {
        if self.is_closed() {
            return Err(PoolClosed);
        }

        select! {
            recv(self.rx) -> buffer => buffer.map_err(|_| PoolClosed),
            recv(self.close_rx) -> _ => Err(PoolClosed),
        }
    }

    /// Takes a buffer from the pool if one is available right away.
    pub fn try_acquire(&self) -> Option<Buffer> {
        self.rx.try_recv().ok()
    }

    /// Clears a buffer and returns it to the pool.
    pub fn release(&self, mut buffer: Buffer) {
        buffer.clear();
        // Buffers of foreign pools would overflow the channel, they are dropped instead.
        let _ = self.tx.try_send(buffer);
    }

    /// Number of buffers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    /// Total number of buffers owned by the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Capacity of each buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Wakes up all threads waiting in [`acquire`](Self::acquire) and makes them fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        drop(self.close_tx.lock().take());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_push_lines() {
        let mut buffer = Buffer::new(10);
        assert!(buffer.push_line(b"abcd"));
        assert!(buffer.push_line(b"efgh"));
        assert_eq!(buffer.as_bytes(), b"abcd\nefgh");

        // Only one byte left, which is taken by the separator.
        assert!(!buffer.fits(1));
        assert!(!buffer.push_line(b"x"));
        assert_eq!(buffer.len(), 9);
    }

    #[test]
    fn test_first_line_without_separator() {
        let mut buffer = Buffer::new(4);
        assert!(buffer.push_line(b"abcd"));
        assert_eq!(buffer.as_bytes(), b"abcd");
    }

    #[test]
    fn test_release_clears() {
        let pool = BufferPool::new(1, 16);
        let mut buffer = pool.acquire().unwrap();
        buffer.push_line(b"hello");
        pool.release(buffer);

        let buffer = pool.acquire().unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 16);
    }

    #[test]
    fn test_pool_bounds_buffers() {
        let pool = BufferPool::new(2, 16);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.try_acquire().is_none());

        pool.release(a);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_acquire_waits_for_release() {
        let pool = Arc::new(BufferPool::new(1, 16));
        let buffer = pool.acquire().unwrap();

        let waiter = thread::spawn({
            let pool = Arc::clone(&pool);
            move || pool.acquire().is_ok()
        });

        thread::sleep(Duration::from_millis(20));
        pool.release(buffer);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_close_interrupts_acquire() {
        let pool = Arc::new(BufferPool::new(1, 16));
        let _buffer = pool.acquire().unwrap();

        let waiter = thread::spawn({
            let pool = Arc::clone(&pool);
            move || pool.acquire().is_err()
        });

        thread::sleep(Duration::from_millis(20));
        let closed_at = Instant::now();
        pool.close();
        assert!(waiter.join().unwrap());
        assert!(closed_at.elapsed() < Duration::from_millis(500));

        assert!(pool.is_closed());
        assert!(pool.acquire().is_err());
    }
}
