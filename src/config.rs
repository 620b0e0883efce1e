//! # Configuration
//!
//! Server configuration loaded from a JSON file, then overridden from the
//! environment. Every field has a default so an empty file `{}` is valid.
//!
//! Environment overrides:
//! - `CTXMESH_MODULE`
//! - `CTXMESH_HOST`
//! - `CTXMESH_PORT`
//! - `CTXMESH_DATA_DIR`
//! - `CTXMESH_JWT_SECRET`
//! - `CTXMESH_LOG_FORMAT`

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregator::{ModuleDescriptor, ModuleDirectory, BUILTIN_MODULES, DEFAULT_MODULES};
use crate::event_log::{ConsumerConfig, EventLogConfig};
use crate::naming::is_valid_name;
use crate::observability::LogFormat;
use crate::realtime::GatewayConfig;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "./ctxmesh.json";

/// Secret used when none is configured; rejected by [`AppConfig::validate`]
/// only when empty
pub const DEV_JWT_SECRET: &str = "ctxmesh-dev-secret-change-me";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ==================
// Sections
// ==================

/// Which module this process serves and where it listens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_module")]
    pub module: String,

    #[serde(default = "default_host")]
    pub host: String,

    /// Defaults to the module's built-in port
    #[serde(default)]
    pub port: Option<u16>,

    /// Empty means any origin
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_module() -> String {
    "finbot".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            module: default_module(),
            host: default_host(),
            port: None,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Configured port, else the module's built-in port, else 5555
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| {
            BUILTIN_MODULES
                .iter()
                .find(|(name, _, _)| *name == self.module)
                .map(|(_, _, port)| *port)
                .unwrap_or(5555)
        })
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.effective_port())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    #[serde(default)]
    pub issuer: Option<String>,

    #[serde(default = "default_token_ttl_minutes")]
    pub token_ttl_minutes: i64,
}

fn default_jwt_secret() -> String {
    DEV_JWT_SECRET.to_string()
}

fn default_token_ttl_minutes() -> i64 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            issuer: None,
            token_ttl_minutes: default_token_ttl_minutes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogSection {
    /// Journal directory; in-memory when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_len")]
    pub max_len: usize,

    #[serde(default = "default_true")]
    pub sync_on_append: bool,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_len() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for EventLogSection {
    fn default() -> Self {
        Self {
            data_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_len: default_max_len(),
            sync_on_append: true,
        }
    }
}

impl EventLogSection {
    pub fn to_log_config(&self) -> EventLogConfig {
        EventLogConfig {
            data_dir: self.data_dir.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_len: self.max_len,
            sync_on_append: self.sync_on_append,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_batch_size() -> usize {
    10
}

fn default_claim_idle_ms() -> u64 {
    300_000
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
            claim_idle_ms: default_claim_idle_ms(),
        }
    }
}

impl ConsumerSection {
    pub fn to_consumer_config(&self, stream: &str, group: &str, consumer: &str) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(stream, group, consumer);
        config.max_retries = self.max_retries;
        config.batch_size = self.batch_size;
        config.claim_idle = Duration::from_millis(self.claim_idle_ms);
        config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeSection {
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Subscribable topics; any valid name when absent
    #[serde(default)]
    pub topics: Option<Vec<String>>,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_max_message_bytes() -> usize {
    64 * 1024
}

fn default_ping_interval_secs() -> u64 {
    30
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            topics: None,
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl RealtimeSection {
    pub fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_message_bytes: self.max_message_bytes,
            allowed_topics: self
                .topics
                .as_ref()
                .map(|topics| topics.iter().cloned().collect::<HashSet<_>>()),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSection {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_modules")]
    pub default_modules: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    4000
}

fn default_cache_ttl_secs() -> u64 {
    5
}

fn default_modules() -> Vec<String> {
    DEFAULT_MODULES.iter().map(|m| m.to_string()).collect()
}

impl Default for AggregationSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            default_modules: default_modules(),
        }
    }
}

/// Module entry of the `modules` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub priority: u8,
}

// ==================
// AppConfig
// ==================

/// Full server configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub event_log: EventLogSection,
    #[serde(default)]
    pub consumer: ConsumerSection,
    #[serde(default)]
    pub realtime: RealtimeSection,
    #[serde(default)]
    pub aggregation: AggregationSection,
    /// Module servers; the built-in set on localhost when empty
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Load from `path`, apply environment overrides and validate
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AppConfig = serde_json::from_str(&content)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when it exists, else start from defaults
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let mut config = AppConfig::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CTXMESH_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(module) = lookup("CTXMESH_MODULE") {
            self.server.module = module;
        }
        if let Some(host) = lookup("CTXMESH_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("CTXMESH_PORT") {
            let parsed = port.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "CTXMESH_PORT",
                value: port.clone(),
            })?;
            self.server.port = Some(parsed);
        }
        if let Some(dir) = lookup("CTXMESH_DATA_DIR") {
            self.event_log.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(secret) = lookup("CTXMESH_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(format) = lookup("CTXMESH_LOG_FORMAT") {
            self.log_format = format.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "CTXMESH_LOG_FORMAT",
                value: format.clone(),
            })?;
        }
        Ok(())
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.auth.jwt_secret.is_empty() {
            return Err(ConfigError::Invalid("auth.jwt_secret must not be empty".into()));
        }
        if self.auth.token_ttl_minutes <= 0 {
            return Err(ConfigError::Invalid("auth.token_ttl_minutes must be > 0".into()));
        }
        if !is_valid_name(&self.server.module) {
            return Err(ConfigError::Invalid(format!(
                "Invalid server.module: '{}'",
                self.server.module
            )));
        }
        if self.aggregation.timeout_ms == 0 {
            return Err(ConfigError::Invalid("aggregation.timeout_ms must be > 0".into()));
        }
        if self.event_log.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("event_log.poll_interval_ms must be > 0".into()));
        }
        if self.realtime.max_message_bytes == 0 {
            return Err(ConfigError::Invalid("realtime.max_message_bytes must be > 0".into()));
        }
        if self.consumer.batch_size == 0 {
            return Err(ConfigError::Invalid("consumer.batch_size must be > 0".into()));
        }
        if let Some(topics) = &self.realtime.topics {
            if let Some(bad) = topics.iter().find(|t| !is_valid_name(t)) {
                return Err(ConfigError::Invalid(format!("Invalid realtime topic: '{}'", bad)));
            }
        }

        let directory = self.module_directory();
        for module in &self.aggregation.default_modules {
            if !directory.contains(module) {
                return Err(ConfigError::Invalid(format!(
                    "Unknown default module: '{}'",
                    module
                )));
            }
        }
        Ok(())
    }

    /// Module directory from `modules`, or the built-in set
    pub fn module_directory(&self) -> ModuleDirectory {
        if self.modules.is_empty() {
            let builtin = ModuleDirectory::builtin("localhost");
            let descriptors = builtin.descriptors().cloned().collect();
            return ModuleDirectory::new(descriptors, self.aggregation.default_modules.clone());
        }
        let descriptors = self
            .modules
            .iter()
            .map(|m| ModuleDescriptor::new(m.name.clone(), m.base_url.clone(), m.priority))
            .collect();
        ModuleDirectory::new(descriptors, self.aggregation.default_modules.clone())
    }

    pub fn aggregation_timeout(&self) -> Duration {
        Duration::from_millis(self.aggregation.timeout_ms)
    }

    pub fn aggregation_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.aggregation.cache_ttl_secs)
    }

    /// Write the configuration as pretty JSON
    pub fn write(&self, path: &Path) -> ConfigResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
    }
}
