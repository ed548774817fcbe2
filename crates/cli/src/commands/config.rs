use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use exportdesk_core::config::AppConfig;
use secrecy::ExposeSecret;
use toml::Value;

use crate::commands::{load_config, CommandResult};

struct Field {
    key: &'static str,
    env_key: &'static str,
    value: String,
}

pub fn run() -> CommandResult {
    let config = match load_config("config") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    CommandResult::success("config", render(&config))
}

/// Effective values with source attribution. Secrets are redacted.
pub fn render(config: &AppConfig) -> String {
    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(config) {
        let source =
            field_source(field.key, field.env_key, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(format!("- {} = {} (source: {source})", field.key, field.value));
    }
    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let field = |key, env_key, value: String| Field { key, env_key, value };
    let signing_secret = match &config.realtime.signing_secret {
        Some(secret) if !secret.expose_secret().trim().is_empty() => "<redacted>",
        Some(_) => "<empty>",
        None => "<unset>",
    };

    vec![
        field("database.url", "EXPORTDESK_DATABASE_URL", config.database.url.clone()),
        field(
            "database.max_connections",
            "EXPORTDESK_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections.to_string(),
        ),
        field(
            "database.timeout_secs",
            "EXPORTDESK_DATABASE_TIMEOUT_SECS",
            config.database.timeout_secs.to_string(),
        ),
        field("server.bind_address", "EXPORTDESK_SERVER_BIND_ADDRESS", config.server.bind_address.clone()),
        field("server.port", "EXPORTDESK_SERVER_PORT", config.server.port.to_string()),
        field(
            "server.graceful_shutdown_secs",
            "EXPORTDESK_SERVER_GRACEFUL_SHUTDOWN_SECS",
            config.server.graceful_shutdown_secs.to_string(),
        ),
        field(
            "orchestration.claim_timeout_secs",
            "EXPORTDESK_ORCHESTRATION_CLAIM_TIMEOUT_SECS",
            config.orchestration.claim_timeout_secs.to_string(),
        ),
        field(
            "orchestration.max_transition_retries",
            "EXPORTDESK_ORCHESTRATION_MAX_TRANSITION_RETRIES",
            config.orchestration.max_transition_retries.to_string(),
        ),
        field(
            "orchestration.reaper_interval_secs",
            "EXPORTDESK_ORCHESTRATION_REAPER_INTERVAL_SECS",
            config.orchestration.reaper_interval_secs.to_string(),
        ),
        field(
            "orchestration.event_channel_capacity",
            "EXPORTDESK_ORCHESTRATION_EVENT_CHANNEL_CAPACITY",
            config.orchestration.event_channel_capacity.to_string(),
        ),
        field("realtime.enabled", "EXPORTDESK_REALTIME_ENABLED", config.realtime.enabled.to_string()),
        field(
            "realtime.webhook_url",
            "EXPORTDESK_REALTIME_WEBHOOK_URL",
            config.realtime.webhook_url.clone().unwrap_or_else(|| "<unset>".to_string()),
        ),
        field("realtime.signing_secret", "EXPORTDESK_REALTIME_SIGNING_SECRET", signing_secret.to_string()),
        field(
            "realtime.timeout_secs",
            "EXPORTDESK_REALTIME_TIMEOUT_SECS",
            config.realtime.timeout_secs.to_string(),
        ),
        field("logging.level", "EXPORTDESK_LOGGING_LEVEL", config.logging.level.clone()),
        field("logging.format", "EXPORTDESK_LOGGING_FORMAT", format!("{:?}", config.logging.format)),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("exportdesk.toml"), PathBuf::from("config/exportdesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::contains_path;

    #[test]
    fn nested_keys_resolve_against_the_file_document() {
        let doc: Value = "[orchestration]\nclaim_timeout_secs = 60\n".parse().expect("toml");

        assert!(contains_path(&doc, "orchestration.claim_timeout_secs"));
        assert!(!contains_path(&doc, "orchestration.reaper_interval_secs"));
        assert!(!contains_path(&doc, "realtime.enabled"));
    }
}
