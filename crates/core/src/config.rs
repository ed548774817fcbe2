use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub orchestration: OrchestrationConfig,
    pub realtime: RealtimeConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct OrchestrationConfig {
    /// Claims older than this are failed by the reaper.
    pub claim_timeout_secs: u64,
    /// Attempts for a journey transition that loses a version race.
    pub max_transition_retries: u32,
    pub reaper_interval_secs: u64,
    pub event_channel_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub signing_secret: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub claim_timeout_secs: Option<u64>,
    pub realtime_enabled: Option<bool>,
    pub realtime_webhook_url: Option<String>,
    pub realtime_signing_secret: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://exportdesk.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            orchestration: OrchestrationConfig {
                claim_timeout_secs: 300,
                max_transition_retries: 3,
                reaper_interval_secs: 30,
                event_channel_capacity: 1024,
            },
            realtime: RealtimeConfig {
                enabled: false,
                webhook_url: None,
                signing_secret: None,
                timeout_secs: 5,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("exportdesk.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(orchestration) = patch.orchestration {
            if let Some(claim_timeout_secs) = orchestration.claim_timeout_secs {
                self.orchestration.claim_timeout_secs = claim_timeout_secs;
            }
            if let Some(max_transition_retries) = orchestration.max_transition_retries {
                self.orchestration.max_transition_retries = max_transition_retries;
            }
            if let Some(reaper_interval_secs) = orchestration.reaper_interval_secs {
                self.orchestration.reaper_interval_secs = reaper_interval_secs;
            }
            if let Some(event_channel_capacity) = orchestration.event_channel_capacity {
                self.orchestration.event_channel_capacity = event_channel_capacity;
            }
        }

        if let Some(realtime) = patch.realtime {
            if let Some(enabled) = realtime.enabled {
                self.realtime.enabled = enabled;
            }
            if let Some(webhook_url) = realtime.webhook_url {
                self.realtime.webhook_url = Some(webhook_url);
            }
            if let Some(signing_secret_value) = realtime.signing_secret {
                self.realtime.signing_secret = Some(secret_value(signing_secret_value));
            }
            if let Some(timeout_secs) = realtime.timeout_secs {
                self.realtime.timeout_secs = timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("EXPORTDESK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("EXPORTDESK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("EXPORTDESK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("EXPORTDESK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("EXPORTDESK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("EXPORTDESK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("EXPORTDESK_SERVER_PORT") {
            self.server.port = parse_u16("EXPORTDESK_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("EXPORTDESK_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("EXPORTDESK_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("EXPORTDESK_ORCHESTRATION_CLAIM_TIMEOUT_SECS") {
            self.orchestration.claim_timeout_secs =
                parse_u64("EXPORTDESK_ORCHESTRATION_CLAIM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("EXPORTDESK_ORCHESTRATION_MAX_TRANSITION_RETRIES") {
            self.orchestration.max_transition_retries =
                parse_u32("EXPORTDESK_ORCHESTRATION_MAX_TRANSITION_RETRIES", &value)?;
        }
        if let Some(value) = read_env("EXPORTDESK_ORCHESTRATION_REAPER_INTERVAL_SECS") {
            self.orchestration.reaper_interval_secs =
                parse_u64("EXPORTDESK_ORCHESTRATION_REAPER_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("EXPORTDESK_ORCHESTRATION_EVENT_CHANNEL_CAPACITY") {
            self.orchestration.event_channel_capacity =
                parse_usize("EXPORTDESK_ORCHESTRATION_EVENT_CHANNEL_CAPACITY", &value)?;
        }

        if let Some(value) = read_env("EXPORTDESK_REALTIME_ENABLED") {
            self.realtime.enabled = parse_bool("EXPORTDESK_REALTIME_ENABLED", &value)?;
        }
        if let Some(value) = read_env("EXPORTDESK_REALTIME_WEBHOOK_URL") {
            self.realtime.webhook_url = Some(value);
        }
        if let Some(value) = read_env("EXPORTDESK_REALTIME_SIGNING_SECRET") {
            self.realtime.signing_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("EXPORTDESK_REALTIME_TIMEOUT_SECS") {
            self.realtime.timeout_secs = parse_u64("EXPORTDESK_REALTIME_TIMEOUT_SECS", &value)?;
        }

        let log_level =
            read_env("EXPORTDESK_LOGGING_LEVEL").or_else(|| read_env("EXPORTDESK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("EXPORTDESK_LOGGING_FORMAT").or_else(|| read_env("EXPORTDESK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(claim_timeout_secs) = overrides.claim_timeout_secs {
            self.orchestration.claim_timeout_secs = claim_timeout_secs;
        }
        if let Some(enabled) = overrides.realtime_enabled {
            self.realtime.enabled = enabled;
        }
        if let Some(webhook_url) = overrides.realtime_webhook_url {
            self.realtime.webhook_url = Some(webhook_url);
        }
        if let Some(signing_secret) = overrides.realtime_signing_secret {
            self.realtime.signing_secret = Some(secret_value(signing_secret));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_orchestration(&self.orchestration)?;
        validate_realtime(&self.realtime)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("exportdesk.toml"), PathBuf::from("config/exportdesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_orchestration(orchestration: &OrchestrationConfig) -> Result<(), ConfigError> {
    if orchestration.claim_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "orchestration.claim_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if orchestration.max_transition_retries == 0 || orchestration.max_transition_retries > 20 {
        return Err(ConfigError::Validation(
            "orchestration.max_transition_retries must be in range 1..=20".to_string(),
        ));
    }
    if orchestration.reaper_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "orchestration.reaper_interval_secs must be greater than zero".to_string(),
        ));
    }
    if orchestration.event_channel_capacity == 0 {
        return Err(ConfigError::Validation(
            "orchestration.event_channel_capacity must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_realtime(realtime: &RealtimeConfig) -> Result<(), ConfigError> {
    if let Some(url) = &realtime.webhook_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "realtime.webhook_url must start with http:// or https://".to_string(),
            ));
        }
    }

    if realtime.enabled {
        if realtime.webhook_url.is_none() {
            return Err(ConfigError::Validation(
                "realtime.enabled is true but realtime.webhook_url is not set".to_string(),
            ));
        }
        let missing_secret = realtime
            .signing_secret
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing_secret {
            return Err(ConfigError::Validation(
                "realtime.signing_secret is required when realtime is enabled".to_string(),
            ));
        }
    }

    if realtime.timeout_secs == 0 || realtime.timeout_secs > 60 {
        return Err(ConfigError::Validation(
            "realtime.timeout_secs must be in range 1..=60".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    orchestration: Option<OrchestrationPatch>,
    realtime: Option<RealtimePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OrchestrationPatch {
    claim_timeout_secs: Option<u64>,
    max_transition_retries: Option<u32>,
    reaper_interval_secs: Option<u64>,
    event_channel_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RealtimePatch {
    enabled: Option<bool>,
    webhook_url: Option<String>,
    signing_secret: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
