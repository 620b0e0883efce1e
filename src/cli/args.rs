//! CLI argument definitions using clap
//!
//! Commands:
//! - ctxmesh serve --config <path> [--module <name>] [--port <n>]
//! - ctxmesh token --id <id> --email <email> --role <role>
//! - ctxmesh init --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::observability::LogFormat;

/// ctxmesh - real-time context and event distribution for module servers
#[derive(Parser, Debug)]
#[command(name = "ctxmesh")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format, overrides the configuration
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one module server
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Module to serve, overrides the configuration
        #[arg(long)]
        module: Option<String>,

        /// Port to listen on, overrides the configuration
        #[arg(long)]
        port: Option<u16>,
    },

    /// Issue a development credential
    Token {
        /// Signing secret; read from the configuration when omitted
        #[arg(long)]
        secret: Option<String>,

        /// Path to configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        #[arg(long)]
        id: String,

        #[arg(long)]
        email: String,

        #[arg(long, default_value = "user")]
        role: String,

        /// Token lifetime in minutes
        #[arg(long, default_value_t = 60)]
        ttl_minutes: i64,
    },

    /// Write a default configuration file
    Init {
        /// Path to configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
