//! `xdmux` Core Library
//!
//! Shared functionality for the xdebug proxy crates:
//! - Configuration resolution (defaults, settings files, environment)
//! - Common error types
//! - Tracing subscriber setup

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, LaunchConfig, XdebugConfig, load_config};
pub use error::{Error, Result};
