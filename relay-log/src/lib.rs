//! Logging facade for the DogStatsD client pipeline.
//!
//! # Setup
//!
//! Libraries never install a subscriber. Applications embedding the client can enable log output
//! with the [`init`] function (feature `init`) and a [`LogConfig`]. The configuration implements
//! `serde` traits, so it can be obtained from configuration files.
//!
//! ```ignore
//! use relay_log::LogConfig;
//!
//! let log_config = LogConfig {
//!     enable_backtraces: true,
//!     ..LogConfig::default()
//! };
//!
//! relay_log::init(&log_config);
//! ```
//!
//! # Logging
//!
//! The basic use of the facade is through the five logging macros: [`error!`], [`warn!`],
//! [`info!`], [`debug!`] and [`trace!`] where `error!` represents the highest-priority log messages
//! and `trace!` the lowest. The macros are re-exported from `tracing`, so they accept structured
//! fields in addition to format strings.
//!
//! ## Conventions
//!
//! Log messages should start lowercase and end without punctuation. Prefer short and precise log
//! messages over verbose text. Choose the log level according to these rules:
//!
//! - [`error!`] for bugs and invalid behavior.
//! - [`warn!`] for undesirable behavior, such as packets that could not be delivered.
//! - [`info!`] for messages relevant to the average user.
//! - [`debug!`] for messages usually relevant to debugging.
//! - [`trace!`] for full auxiliary information.
//!
//! ## Examples
//!
//! ```
//! relay_log::info!("startup complete");
//! ```
//!
//! ## Logging Error Types
//!
//! To log errors with all of their causes, either pass them as a structured `error` field or use
//! the [`LogError`] wrapper.
//!
//! ```
//! use std::io::{Error, ErrorKind};
//! use relay_log::LogError;
//!
//! let custom_error = Error::new(ErrorKind::Other, "oh no!");
//! relay_log::error!(error = &custom_error as &dyn std::error::Error, "operation failed");
//! relay_log::error!("operation failed: {}", LogError(&custom_error));
//! ```
//!
//! # Testing
//!
//! For unit testing, there is a separate initialization macro [`init_test!`] (feature `test`) that
//! should be called at the beginning of test method. It enables test mode of the logger and
//! customizes log levels for the current crate.
//!
//! ```ignore
//! #[test]
//! fn test_something() {
//!     relay_log::init_test!();
//! }
//! ```

#![warn(missing_docs)]

mod setup;
pub use setup::*;

#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

// Expose the minimal log facade.
#[doc(inline)]
pub use tracing::{debug, error, info, trace, warn};
