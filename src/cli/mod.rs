//! CLI module for ctxmesh
//!
//! Provides command-line interface for:
//! - serve: Run one module server
//! - token: Issue a development credential
//! - init: Write a default configuration file

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{init, run, run_command, serve, token};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_json, write_json_to};
