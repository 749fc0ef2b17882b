use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Sender, select};

/// A named thread invoking a callback at a fixed interval.
///
/// Stopping the timer waits for a running callback to complete, so no callback runs after
/// [`stop`](Self::stop) returns.
#[derive(Debug)]
pub struct Timer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// Spawns the timer thread. The first callback runs one `interval` after spawning.
    pub fn spawn<F>(name: &str, interval: Duration, mut callback: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let ticks = crossbeam_channel::tick(interval);

        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticks) -> _ => callback(),
                    }
                }
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Cancels the timer and waits for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Disconnecting the channel wakes up the thread.
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                relay_log::error!("timer thread panicked");
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
