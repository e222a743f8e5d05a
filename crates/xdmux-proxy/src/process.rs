//! Runtime processes started on behalf of the debugger.
//!
//! Two kinds: the dummy request that makes the runtime open the pre-load
//! evaluation connection, and (in script mode) the script being debugged.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use xdmux_core::LaunchConfig;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to spawn runtime process: {reason}")]
    SpawnFailed { reason: String },
}

/// A process that can be force-killed.
pub trait ProcessHandle: Send + Sync {
    fn id(&self) -> Option<u32>;

    /// Kill immediately (SIGKILL on unix). Idempotent.
    fn kill(&mut self);
}

/// Starts runtime processes under debugger instrumentation.
pub trait ProcessLauncher: Send + Sync {
    /// Run the dummy request script against `port`.
    fn send_dummy_request(&self, port: u16) -> Result<Box<dyn ProcessHandle>, LaunchError>;

    /// Launch `script` (with optional whitespace-separated arguments)
    /// against `port`, streaming each stdout line into `output`.
    fn launch_script(
        &self,
        script: &str,
        port: u16,
        output: mpsc::UnboundedSender<String>,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError>;
}

/// [`ProcessLauncher`] running the configured PHP runtime.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    runtime_path: PathBuf,
    runtime_args: Vec<String>,
    dummy_request_file: PathBuf,
}

impl CommandLauncher {
    pub fn new(config: &LaunchConfig) -> Self {
        Self {
            runtime_path: config.php_runtime_path.clone(),
            runtime_args: config.php_runtime_args.clone(),
            dummy_request_file: config.dummy_request_file_path.clone(),
        }
    }

    fn command(&self, port: u16, script: &Path, script_args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.runtime_path);
        cmd.args(&self.runtime_args)
            .arg("-d")
            .arg("xdebug.enable=1")
            .arg("-d")
            .arg("xdebug.remote_enable=1")
            .arg("-d")
            .arg("xdebug.remote_autostart=1")
            .arg("-d")
            .arg(format!("xdebug.remote_port={port}"))
            .arg(script)
            .args(script_args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl ProcessLauncher for CommandLauncher {
    fn send_dummy_request(&self, port: u16) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        let mut cmd = self.command(port, &self.dummy_request_file, &[]);
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        info!(
            runtime = %self.runtime_path.display(),
            file = %self.dummy_request_file.display(),
            port,
            "Sending dummy request"
        );
        let child = cmd.spawn().map_err(|e| LaunchError::SpawnFailed {
            reason: e.to_string(),
        })?;
        Ok(Box::new(ChildHandle::new("dummy-request", child)))
    }

    fn launch_script(
        &self,
        script: &str,
        port: u16,
        output: mpsc::UnboundedSender<String>,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        let mut parts = script.split_whitespace();
        let script_path = parts.next().ok_or_else(|| LaunchError::SpawnFailed {
            reason: "empty script path".to_string(),
        })?;
        let script_args: Vec<&str> = parts.collect();

        let mut cmd = self.command(port, Path::new(script_path), &script_args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        info!(script = script_path, args = ?script_args, port, "Launching script");
        let mut child = cmd.spawn().map_err(|e| LaunchError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| LaunchError::SpawnFailed {
            reason: "Failed to capture stdout".to_string(),
        })?;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if output.send(line).is_err() {
                    debug!("script output receiver closed");
                    break;
                }
            }
            debug!("script stdout reader finished");
        });

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("script stderr: {}", line);
                }
            });
        }

        Ok(Box::new(ChildHandle::new("script", child)))
    }
}

struct ChildHandle {
    label: &'static str,
    child: Child,
}

impl ChildHandle {
    const fn new(label: &'static str, child: Child) -> Self {
        Self { label, child }
    }
}

impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn kill(&mut self) {
        match self.child.start_kill() {
            Ok(()) => info!(process = self.label, "Killed runtime process"),
            // Already reaped.
            Err(e) => debug!(process = self.label, error = %e, "Kill skipped"),
        }
    }
}
