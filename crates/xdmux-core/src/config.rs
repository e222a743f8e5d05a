//! Configuration resolution for xdmux.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/xdmux/settings.json`)
//! 3. Explicit settings file (e.g. passed by the front end)
//! 4. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Complete xdmux configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub xdebug: XdebugConfig,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            xdebug: XdebugConfig::default(),
            launch: LaunchConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Debugger-port configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XdebugConfig {
    /// Port for externally initiated (attach) sessions.
    pub attach_port: u16,
    /// Port for the dummy connection and, in script mode, the launched script.
    pub launching_port: u16,
    /// When set, incoming `init` packets must carry this IDE key.
    pub idekey: Option<String>,
    /// End the session as soon as no request connections remain.
    pub end_debug_when_no_requests: bool,
}

impl Default for XdebugConfig {
    fn default() -> Self {
        Self {
            attach_port: 9000,
            launching_port: 10112,
            idekey: None,
            end_debug_when_no_requests: false,
        }
    }
}

/// Runtime launch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Script (plus arguments) to launch; enables script-only mode.
    pub script_path: Option<String>,
    pub php_runtime_path: PathBuf,
    pub php_runtime_args: Vec<String>,
    /// Script run to open the dummy (pre-load evaluation) connection.
    pub dummy_request_file_path: PathBuf,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            script_path: None,
            php_runtime_path: PathBuf::from("hhvm"),
            php_runtime_args: Vec::new(),
            dummy_request_file_path: PathBuf::from("php_only_xdebug_request.php"),
        }
    }
}

impl Config {
    /// Whether the proxy runs in script-only mode.
    pub const fn is_script_mode(&self) -> bool {
        self.launch.script_path.is_some()
    }

    /// Check invariants that cannot be recovered from at runtime.
    pub fn validate(&self) -> Result<()> {
        if !self.is_script_mode() && self.xdebug.attach_port == self.xdebug.launching_port {
            return Err(Error::Config(format!(
                "attach_port and launching_port must differ in attach mode (both {})",
                self.xdebug.attach_port
            )));
        }
        if self.xdebug.launching_port == 0 {
            return Err(Error::Config("launching_port must be non-zero".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(settings_file: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = load_config_file(&global_path)?;
        debug!(path = %global_path.display(), "Loaded global config");
    }

    if let Some(path) = settings_file {
        config = load_config_file(path)?;
        debug!(path = %path.display(), "Loaded settings file");
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("xdmux").join("settings.json"))
}

/// Unreadable files yield `Error::Io`, malformed ones `Error::Json`.
fn load_config_file(path: &Path) -> Result<Config> {
    debug!(path = %path.display(), "Reading config file");
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("XDMUX_ATTACH_PORT").and_then(|v| v.parse().ok()) {
        config.xdebug.attach_port = n;
    }
    if let Some(n) = var("XDMUX_LAUNCHING_PORT").and_then(|v| v.parse().ok()) {
        config.xdebug.launching_port = n;
    }
    if let Some(key) = var("XDMUX_IDEKEY") {
        config.xdebug.idekey = Some(key);
    }
    if let Some(flag) = var("XDMUX_END_WHEN_IDLE").and_then(|v| v.parse().ok()) {
        config.xdebug.end_debug_when_no_requests = flag;
    }
    if let Some(script) = var("XDMUX_LAUNCH_SCRIPT") {
        config.launch.script_path = Some(script);
    }
    if let Some(level) = var("XDMUX_LOG_LEVEL") {
        config.log_level = level;
    }
}
