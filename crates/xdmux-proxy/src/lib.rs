//! xdmux Proxy Library
//!
//! Presents several concurrent xdebug (DBGp) connections from one debugged
//! process as a single, serially-steppable debugger connection:
//! - Collaborator contracts for peers, connectors, and the client UI
//! - TCP connector with `init` handshake parsing
//! - Breakpoint store shared by every request connection
//! - The connection multiplexer state machine and its async shell

pub mod breakpoint;
pub mod callback;
pub mod connection;
pub mod connector;
pub mod multiplexer;
pub mod process;
pub mod transport;

pub use multiplexer::{ConnectionMultiplexer, MultiplexerConfig, MultiplexerError, MultiplexerStatus};
