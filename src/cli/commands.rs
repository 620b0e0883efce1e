//! CLI command implementations

use std::path::Path;

use chrono::Duration;
use serde_json::json;
use tracing::info;

use crate::auth::{Identity, JwtConfig, JwtManager};
use crate::config::AppConfig;
use crate::http_server::{shutdown_signal, ModuleServer};
use crate::observability::{init_tracing, LogFormat};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::write_json;

/// Parse arguments and run the selected command
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command, cli.log_format)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command, log_format: Option<LogFormat>) -> CliResult<()> {
    match cmd {
        Command::Serve { config, module, port } => serve(&config, module, port, log_format),
        Command::Token {
            secret,
            config,
            id,
            email,
            role,
            ttl_minutes,
        } => {
            let identity = Identity {
                user_id: id,
                email,
                role,
            };
            let token = token(secret, &config, &identity, ttl_minutes)?;
            write_json(&json!({ "token": token, "expiresInMinutes": ttl_minutes }))
        }
        Command::Init { config, force } => init(&config, force),
    }
}

/// Write a default configuration to `config_path`
pub fn init(config_path: &Path, force: bool) -> CliResult<()> {
    if config_path.exists() && !force {
        return Err(CliError::already_initialized(config_path));
    }
    AppConfig::default().write(config_path)?;
    write_json(&json!({ "status": "initialized", "config": config_path.display().to_string() }))
}

/// Issue a signed credential for `identity`
///
/// Uses `secret` when given, else the configured secret.
pub fn token(
    secret: Option<String>,
    config_path: &Path,
    identity: &Identity,
    ttl_minutes: i64,
) -> CliResult<String> {
    if ttl_minutes <= 0 {
        return Err(CliError::config_error("--ttl-minutes must be > 0"));
    }
    let secret = match secret {
        Some(secret) => secret,
        None => AppConfig::load_or_default(config_path)?.auth.jwt_secret,
    };
    if secret.is_empty() {
        return Err(CliError::config_error("secret must not be empty"));
    }

    let manager = JwtManager::new(JwtConfig::new(secret));
    Ok(manager.issue_with_ttl(identity, Duration::minutes(ttl_minutes))?)
}

/// Boot one module server and run until interrupted
pub fn serve(
    config_path: &Path,
    module: Option<String>,
    port: Option<u16>,
    log_format: Option<LogFormat>,
) -> CliResult<()> {
    let mut config = AppConfig::load_or_default(config_path)?;
    if let Some(module) = module {
        config.server.module = module;
    }
    if let Some(port) = port {
        config.server.port = Some(port);
    }
    config.validate()?;

    init_tracing(log_format.unwrap_or(config.log_format));
    info!(
        module = %config.server.module,
        addr = %config.server.socket_addr(),
        durable = config.event_log.data_dir.is_some(),
        "starting module server"
    );

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::serve_failed(format!("Failed to create tokio runtime: {}", e)))?;

    rt.block_on(async {
        let server = ModuleServer::new(config)?;
        server.serve(shutdown_signal()).await?;
        Ok::<_, CliError>(())
    })?;

    info!("module server stopped");
    Ok(())
}
