//! Multiplexer types.

use std::fmt;
use std::path::PathBuf;

use xdmux_core::Config;

use crate::breakpoint::BreakpointError;
use crate::connection::ConnectionError;
use crate::connector::ConnectorError;
use crate::process::LaunchError;

/// Externally observable status of the whole multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MultiplexerStatus {
    Starting,
    Running,
    Break,
    Stopping,
    Stopped,
    Error,
    /// Terminal: no further transitions.
    End,
}

impl fmt::Display for MultiplexerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Break => "break",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::End => "end",
        };
        f.write_str(s)
    }
}

/// Configuration for the connection multiplexer.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub attach_port: u16,
    pub launching_port: u16,
    /// Script (and arguments) to launch; `None` means attach mode.
    pub launch_script: Option<String>,
    pub idekey: Option<String>,
    pub dummy_request_file: PathBuf,
    pub end_debug_when_no_requests: bool,
    /// Capacity of the status broadcast channel.
    pub status_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for MultiplexerConfig {
    fn from(config: &Config) -> Self {
        Self {
            attach_port: config.xdebug.attach_port,
            launching_port: config.xdebug.launching_port,
            launch_script: config.launch.script_path.clone(),
            idekey: config.xdebug.idekey.clone(),
            dummy_request_file: config.launch.dummy_request_file_path.clone(),
            end_debug_when_no_requests: config.xdebug.end_debug_when_no_requests,
            status_capacity: 64,
        }
    }
}

/// Multiplexer errors.
#[derive(Debug, thiserror::Error)]
pub enum MultiplexerError {
    /// The operation needs a peer that is not currently available.
    #[error("No connection")]
    NoConnection,

    #[error("Peer error: {0}")]
    Peer(#[from] ConnectionError),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("Breakpoint error: {0}")]
    Breakpoint(#[from] BreakpointError),

    #[error("Multiplexer is already listening")]
    AlreadyListening,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
