//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Running the backup poller
//! - Inspecting dataset checkpoints
//! - Showing the effective configuration

pub mod commands;
pub mod handlers;

pub use handlers::{daemonize, handle_config, handle_run, handle_status, init_logging};
