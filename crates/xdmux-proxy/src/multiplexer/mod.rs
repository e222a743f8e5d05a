//! Connection multiplexing.
//!
//! Folds every xdebug request connection of the debugged process into one
//! logical connection with at most one enabled (broken) peer at a time.

#[allow(clippy::module_inception)]
mod multiplexer;
mod state;
mod types;

pub use multiplexer::ConnectionMultiplexer;
pub use state::REQUEST_SWITCH_MESSAGE;
pub use types::{MultiplexerConfig, MultiplexerError, MultiplexerStatus};
