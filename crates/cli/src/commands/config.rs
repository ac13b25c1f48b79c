use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use mesa_core::config::{AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, value, env_key) in effective_values(&config) {
        let source =
            field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key_path, &value, source));
    }

    lines.join("\n")
}

fn effective_values(config: &AppConfig) -> Vec<(&'static str, String, &'static str)> {
    let api_key = if config.agent.has_api_key() { "<redacted>" } else { "<unset>" };

    vec![
        ("database.url", config.database.url.clone(), "MESA_DATABASE_URL"),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            "MESA_DATABASE_MAX_CONNECTIONS",
        ),
        ("database.timeout_secs", config.database.timeout_secs.to_string(), "MESA_DATABASE_TIMEOUT_SECS"),
        (
            "database.call_timeout_ms",
            config.database.call_timeout_ms.to_string(),
            "MESA_DATABASE_CALL_TIMEOUT_MS",
        ),
        (
            "reservations.bucket_capacity",
            config.reservations.bucket_capacity.to_string(),
            "MESA_RESERVATIONS_BUCKET_CAPACITY",
        ),
        (
            "reservations.max_party_size",
            config.reservations.max_party_size.to_string(),
            "MESA_RESERVATIONS_MAX_PARTY_SIZE",
        ),
        (
            "reservations.cancelled_retention_days",
            config.reservations.cancelled_retention_days.to_string(),
            "MESA_RESERVATIONS_CANCELLED_RETENTION_DAYS",
        ),
        ("session.window_turns", config.session.window_turns.to_string(), "MESA_SESSION_WINDOW_TURNS"),
        (
            "session.dedup_retention_secs",
            config.session.dedup_retention_secs.to_string(),
            "MESA_SESSION_DEDUP_RETENTION_SECS",
        ),
        (
            "session.idle_reset_minutes",
            config.session.idle_reset_minutes.to_string(),
            "MESA_SESSION_IDLE_RESET_MINUTES",
        ),
        ("agent.restaurant_name", config.agent.restaurant_name.clone(), "MESA_AGENT_RESTAURANT_NAME"),
        ("agent.timeout_secs", config.agent.timeout_secs.to_string(), "MESA_AGENT_TIMEOUT_SECS"),
        ("agent.api_key", api_key.to_string(), "MESA_AGENT_API_KEY"),
        (
            "messaging.max_message_length",
            config.messaging.max_message_length.to_string(),
            "MESA_MESSAGING_MAX_MESSAGE_LENGTH",
        ),
        ("server.bind_address", config.server.bind_address.clone(), "MESA_SERVER_BIND_ADDRESS"),
        ("server.port", config.server.port.to_string(), "MESA_SERVER_PORT"),
        ("server.environment", config.server.environment.as_str().to_string(), "MESA_SERVER_ENVIRONMENT"),
        (
            "server.purge_interval_secs",
            config.server.purge_interval_secs.to_string(),
            "MESA_SERVER_PURGE_INTERVAL_SECS",
        ),
        ("logging.level", config.logging.level.clone(), "MESA_LOGGING_LEVEL"),
        ("logging.format", format!("{:?}", config.logging.format), "MESA_LOGGING_FORMAT"),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["mesa.toml", "config/mesa.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
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

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
