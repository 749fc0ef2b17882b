use std::io;

/// A recoverable error that occurred in the pipeline.
///
/// These errors never reach the code recording metrics. They are passed to the client's
/// [`ErrorHandler`] instead and the affected data is dropped.
#[derive(Debug, thiserror::Error)]
pub enum StatsdError {
    /// A rendered line does not fit into a single packet.
    #[error("message of {size} bytes exceeds the maximum packet size of {capacity} bytes")]
    UnsendableMessage {
        /// Length of the rendered line.
        size: usize,
        /// Capacity of a packet buffer.
        capacity: usize,
    },
    /// The transport accepted only part of a packet.
    #[error("could not send entire packet, only sent {written} out of {expected} bytes")]
    ShortWrite {
        /// Number of bytes written.
        written: usize,
        /// Length of the packet.
        expected: usize,
    },
    /// The transport failed to write a packet.
    #[error("failed to write packet to transport")]
    Transport(#[source] io::Error),
    /// The transport failed to close.
    #[error("failed to close transport")]
    Close(#[source] io::Error),
}

/// A fatal error returned when setting up a client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The configuration contains an invalid value.
    #[error("invalid client configuration: {0}")]
    InvalidConfig(&'static str),
    /// The transport could not be opened.
    #[error("failed to connect to the agent")]
    Connect(#[source] io::Error),
    /// A worker thread could not be started.
    #[error("failed to spawn worker thread")]
    Spawn(#[source] io::Error),
}

/// Receives errors from all stages of the pipeline.
///
/// Handlers are called concurrently from processor and sender threads and must not block for
/// long. Closures implement this trait:
///
/// ```
/// use relay_dogstatsd::{ErrorHandler, StatsdError};
///
/// fn assert_handler(_: impl ErrorHandler) {}
/// assert_handler(|error: StatsdError| eprintln!("{error}"));
/// ```
pub trait ErrorHandler: Send + Sync {
    /// Handles a single error.
    fn handle(&self, error: StatsdError);
}

impl<F> ErrorHandler for F
where
    F: Fn(StatsdError) + Send + Sync,
{
    fn handle(&self, error: StatsdError) {
        self(error)
    }
}

/// Logs errors through `relay_log`. This is the default handler.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogErrorHandler;

impl ErrorHandler for LogErrorHandler {
    fn handle(&self, error: StatsdError) {
        match error {
            StatsdError::UnsendableMessage { .. } => {
                relay_log::warn!("dropping metric: {error}");
            }
            error => {
                relay_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to send metrics to the agent"
                );
            }
        }
    }
}

/// Discards all errors.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopErrorHandler;

impl ErrorHandler for NoopErrorHandler {
    fn handle(&self, _error: StatsdError) {}
}

/// Collects errors for inspection in tests.
#[cfg(any(test, feature = "test"))]
#[derive(Debug, Default)]
pub struct RecordingErrorHandler {
    errors: parking_lot::Mutex<Vec<String>>,
}

#[cfg(any(test, feature = "test"))]
impl RecordingErrorHandler {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::default()
    }

    /// Returns the display representation of all recorded errors.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

#[cfg(any(test, feature = "test"))]
impl ErrorHandler for RecordingErrorHandler {
    fn handle(&self, error: StatsdError) {
        self.errors.lock().push(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_error_display() {
        let error = StatsdError::UnsendableMessage {
            size: 2000,
            capacity: 1432,
        };
        assert_eq!(
            error.to_string(),
            "message of 2000 bytes exceeds the maximum packet size of 1432 bytes"
        );

        let error = StatsdError::ShortWrite {
            written: 3,
            expected: 10,
        };
        assert_eq!(
            error.to_string(),
            "could not send entire packet, only sent 3 out of 10 bytes"
        );
    }

    #[test]
    fn test_log_handler_does_not_panic() {
        relay_log::init_test!();
        LogErrorHandler.handle(StatsdError::Transport(io::Error::other("boom")));
        LogErrorHandler.handle(StatsdError::UnsendableMessage {
            size: 2,
            capacity: 1,
        });
    }

    #[test]
    fn test_closure_handler() {
        let handler = RecordingErrorHandler::new();
        let forward = {
            let handler = handler.clone();
            move |error: StatsdError| handler.handle(error)
        };
        forward.handle(StatsdError::Close(io::Error::other("gone")));
        assert_eq!(handler.errors(), ["failed to close transport"]);
    }
}
