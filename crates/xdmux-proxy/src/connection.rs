//! Contract for one debugger-protocol peer session.
//!
//! A [`Connection`] wraps a single DBGp socket. The wire protocol itself lives
//! outside this crate; the multiplexer only needs the narrow surface below.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::breakpoint::Breakpoint;

/// Identifier assigned to each accepted connection, in acceptance order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Status reported by a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Starting,
    Stopping,
    Stopped,
    Running,
    Break,
    Error,
    End,
    /// Redirected stdout text; carries a message, does not change state.
    Stdout,
    /// Redirected stderr text; carries a message, does not change state.
    Stderr,
}

impl ConnectionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Break => "break",
            Self::Error => "error",
            Self::End => "end",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    /// Statuses after which the connection is removed.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::End | Self::Error)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            "break" => Ok(Self::Break),
            "error" => Ok(Self::Error),
            "end" => Ok(Self::End),
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            other => Err(ConnectionError::Protocol(format!("unknown status: {other}"))),
        }
    }
}

/// A status change notification from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: ConnectionStatus,
    /// Error text for `Error`, output text for `Stdout`/`Stderr`.
    pub message: Option<String>,
}

impl StatusEvent {
    pub const fn new(status: ConnectionStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }

    pub fn with_message(status: ConnectionStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }
}

/// DBGp continuation commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationCommand {
    Run,
    StepInto,
    StepOver,
    StepOut,
    Stop,
    Detach,
}

impl ContinuationCommand {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::StepInto => "step_into",
            Self::StepOver => "step_over",
            Self::StepOut => "step_out",
            Self::Stop => "stop",
            Self::Detach => "detach",
        }
    }
}

impl fmt::Display for ContinuationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call stack of the enabled connection. Empty while nothing is broken.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTrace {
    pub frames: Vec<StackFrame>,
}

impl StackTrace {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub index: u32,
    pub function: String,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub name: String,
    pub object_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub value: serde_json::Value,
    /// Set when the property has children that can be fetched by id.
    pub object_id: Option<String>,
}

/// Error payload a peer attaches to a failed evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub result: Option<serde_json::Value>,
    pub was_thrown: bool,
    pub error: Option<PeerError>,
}

impl EvaluationResult {
    pub const fn value(value: serde_json::Value) -> Self {
        Self {
            result: Some(value),
            was_thrown: false,
            error: None,
        }
    }

    pub fn thrown(code: i64, message: impl Into<String>) -> Self {
        Self {
            result: None,
            was_thrown: true,
            error: Some(PeerError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Peer communication failures.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out waiting for peer response")]
    Timeout,
}

/// One peer debugger session over one socket.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Subscribe to status changes, delivered in the order the peer reports
    /// them. Dropping the receiver ends the subscription.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusEvent>;

    /// Query the peer's current status.
    async fn status(&self) -> Result<ConnectionStatus, ConnectionError>;

    /// Send a continuation command. The resulting status arrives through
    /// the subscription.
    async fn send_continuation_command(
        &self,
        command: ContinuationCommand,
    ) -> Result<(), ConnectionError>;

    async fn send_break_command(&self) -> Result<bool, ConnectionError>;

    async fn send_stdout_request(&self) -> Result<bool, ConnectionError>;

    async fn send_stderr_request(&self) -> Result<bool, ConnectionError>;

    async fn set_feature(&self, name: &str, value: &str) -> Result<bool, ConnectionError>;

    async fn runtime_evaluate(
        &self,
        frame_index: u32,
        expression: &str,
    ) -> Result<EvaluationResult, ConnectionError>;

    async fn evaluate_on_call_frame(
        &self,
        frame_index: u32,
        expression: &str,
    ) -> Result<EvaluationResult, ConnectionError>;

    async fn stack_frames(&self) -> Result<StackTrace, ConnectionError>;

    async fn scopes_for_frame(&self, frame_index: u32) -> Result<Vec<Scope>, ConnectionError>;

    async fn properties(&self, object_id: &str)
    -> Result<Vec<PropertyDescriptor>, ConnectionError>;

    /// Install a breakpoint, returning the peer's breakpoint id.
    async fn set_breakpoint(&self, breakpoint: &Breakpoint) -> Result<String, ConnectionError>;

    async fn remove_breakpoint(&self, peer_breakpoint_id: &str) -> Result<(), ConnectionError>;

    /// Release the socket. Further calls fail with [`ConnectionError::Closed`].
    fn dispose(&self);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_dbgp_names() {
        for status in [
            ConnectionStatus::Starting,
            ConnectionStatus::Stopping,
            ConnectionStatus::Stopped,
            ConnectionStatus::Running,
            ConnectionStatus::Break,
            ConnectionStatus::Error,
            ConnectionStatus::End,
            ConnectionStatus::Stdout,
            ConnectionStatus::Stderr,
        ] {
            assert_eq!(status.as_str().parse::<ConnectionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<ConnectionStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ConnectionStatus::Stopped.is_terminal());
        assert!(ConnectionStatus::End.is_terminal());
        assert!(ConnectionStatus::Error.is_terminal());
        assert!(!ConnectionStatus::Break.is_terminal());
        assert!(!ConnectionStatus::Stdout.is_terminal());
    }

    #[test]
    fn thrown_result_carries_peer_error() {
        let result = EvaluationResult::thrown(206, "undefined variable");
        assert!(result.was_thrown);
        assert_eq!(result.error.unwrap().code, 206);
        assert!(result.result.is_none());
    }
}
