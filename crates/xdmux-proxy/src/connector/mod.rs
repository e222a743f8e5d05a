//! Listening endpoints that accept peer sockets.
//!
//! A connector reports each accepted socket together with its parsed
//! `init` handshake; classification (dummy vs. request, valid vs. rejected)
//! is left to the multiplexer.

mod handshake;
mod tcp;

use std::fmt;

use async_trait::async_trait;

pub use handshake::{Handshake, HandshakeError};
pub use tcp::{TcpConnector, fail_connection, read_packet};

/// Which of the two connectors an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    /// Externally initiated sessions (attach mode).
    Attach,
    /// The dummy connection and, in script mode, the launched script.
    Launch,
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attach => f.write_str("attach"),
            Self::Launch => f.write_str("launch"),
        }
    }
}

/// Events reported by a connector.
#[derive(Debug)]
pub enum ConnectorEvent<S> {
    Attach {
        kind: ConnectorKind,
        socket: S,
        handshake: Handshake,
    },
    /// The listener stopped accepting; the connector will report nothing else.
    Close { kind: ConnectorKind },
    Error { kind: ConnectorKind, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Failed to listen on port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A listening endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> ConnectorKind;

    fn port(&self) -> u16;

    /// Start accepting connections.
    async fn listen(&mut self) -> Result<(), ConnectorError>;

    /// Stop accepting. Safe to call more than once.
    fn dispose(&mut self);
}
