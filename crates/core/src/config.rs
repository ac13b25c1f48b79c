use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::session::SessionPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub reservations: ReservationsConfig,
    pub session: SessionConfig,
    pub agent: AgentConfig,
    pub messaging: MessagingConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
    /// Upper bound for a single storage call before it counts as unavailable.
    pub call_timeout_ms: u64,
    pub transient_retries: u32,
}

#[derive(Clone, Debug)]
pub struct ReservationsConfig {
    pub bucket_capacity: u32,
    pub max_party_size: u32,
    pub write_attempts: u32,
    pub cancelled_retention_days: u32,
    pub completed_retention_days: u32,
    pub page_size: u32,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub window_turns: u32,
    pub dedup_retention_secs: u64,
    pub dedup_max_entries: u32,
    /// Zero disables idle rotation.
    pub idle_reset_minutes: u32,
    pub write_attempts: u32,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub restaurant_name: String,
    pub timeout_secs: u64,
    pub api_key: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct MessagingConfig {
    pub max_message_length: usize,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub environment: Environment,
    pub graceful_shutdown_secs: u64,
    /// Zero disables the background TTL purge.
    pub purge_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
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
    pub environment: Option<Environment>,
    pub port: Option<u16>,
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
                url: "sqlite://mesa.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
                call_timeout_ms: 2_000,
                transient_retries: 2,
            },
            reservations: ReservationsConfig {
                bucket_capacity: 40,
                max_party_size: 20,
                write_attempts: 3,
                cancelled_retention_days: 30,
                completed_retention_days: 90,
                page_size: 50,
            },
            session: SessionConfig {
                window_turns: 20,
                dedup_retention_secs: 86_400,
                dedup_max_entries: 200,
                idle_reset_minutes: 30,
                write_attempts: 5,
            },
            agent: AgentConfig {
                restaurant_name: "El Rincón de Andalucía".to_string(),
                timeout_secs: 30,
                api_key: None,
            },
            messaging: MessagingConfig { max_message_length: 1600 },
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 8000,
                environment: Environment::Production,
                graceful_shutdown_secs: 15,
                purge_interval_secs: 3_600,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::Validation(format!(
                "unsupported environment `{other}` (expected development|production|test)"
            ))),
        }
    }
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

impl SessionConfig {
    pub fn policy(&self) -> SessionPolicy {
        SessionPolicy {
            window_turns: self.window_turns as usize,
            dedup_retention: Duration::seconds(
                self.dedup_retention_secs.min(MAX_DEDUP_RETENTION_SECS) as i64,
            ),
            dedup_max_entries: self.dedup_max_entries as usize,
            idle_reset: (self.idle_reset_minutes > 0)
                .then(|| Duration::minutes(i64::from(self.idle_reset_minutes))),
        }
    }
}

impl ReservationsConfig {
    pub fn cancelled_retention(&self) -> Duration {
        Duration::days(i64::from(self.cancelled_retention_days.min(MAX_RETENTION_DAYS)))
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::days(i64::from(self.completed_retention_days.min(MAX_RETENTION_DAYS)))
    }
}

impl AgentConfig {
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_ref().is_some_and(|key| !key.expose_secret().trim().is_empty())
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("mesa.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            set(&mut self.database.url, database.url);
            set(&mut self.database.max_connections, database.max_connections);
            set(&mut self.database.timeout_secs, database.timeout_secs);
            set(&mut self.database.call_timeout_ms, database.call_timeout_ms);
            set(&mut self.database.transient_retries, database.transient_retries);
        }

        if let Some(reservations) = patch.reservations {
            set(&mut self.reservations.bucket_capacity, reservations.bucket_capacity);
            set(&mut self.reservations.max_party_size, reservations.max_party_size);
            set(&mut self.reservations.write_attempts, reservations.write_attempts);
            set(
                &mut self.reservations.cancelled_retention_days,
                reservations.cancelled_retention_days,
            );
            set(
                &mut self.reservations.completed_retention_days,
                reservations.completed_retention_days,
            );
            set(&mut self.reservations.page_size, reservations.page_size);
        }

        if let Some(session) = patch.session {
            set(&mut self.session.window_turns, session.window_turns);
            set(&mut self.session.dedup_retention_secs, session.dedup_retention_secs);
            set(&mut self.session.dedup_max_entries, session.dedup_max_entries);
            set(&mut self.session.idle_reset_minutes, session.idle_reset_minutes);
            set(&mut self.session.write_attempts, session.write_attempts);
        }

        if let Some(agent) = patch.agent {
            set(&mut self.agent.restaurant_name, agent.restaurant_name);
            set(&mut self.agent.timeout_secs, agent.timeout_secs);
            if let Some(agent_api_key_value) = agent.api_key {
                self.agent.api_key = Some(agent_api_key_value.into());
            }
        }

        if let Some(messaging) = patch.messaging {
            set(&mut self.messaging.max_message_length, messaging.max_message_length);
        }

        if let Some(server) = patch.server {
            set(&mut self.server.bind_address, server.bind_address);
            set(&mut self.server.port, server.port);
            set(&mut self.server.environment, server.environment);
            set(&mut self.server.graceful_shutdown_secs, server.graceful_shutdown_secs);
            set(&mut self.server.purge_interval_secs, server.purge_interval_secs);
        }

        if let Some(logging) = patch.logging {
            set(&mut self.logging.level, logging.level);
            set(&mut self.logging.format, logging.format);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("MESA_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("MESA_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("MESA_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("MESA_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("MESA_DATABASE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("MESA_DATABASE_CALL_TIMEOUT_MS") {
            self.database.call_timeout_ms = parse_u64("MESA_DATABASE_CALL_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("MESA_DATABASE_TRANSIENT_RETRIES") {
            self.database.transient_retries =
                parse_u32("MESA_DATABASE_TRANSIENT_RETRIES", &value)?;
        }

        if let Some(value) = read_env("MESA_RESERVATIONS_BUCKET_CAPACITY") {
            self.reservations.bucket_capacity =
                parse_u32("MESA_RESERVATIONS_BUCKET_CAPACITY", &value)?;
        }
        if let Some(value) = read_env("MESA_RESERVATIONS_MAX_PARTY_SIZE") {
            self.reservations.max_party_size =
                parse_u32("MESA_RESERVATIONS_MAX_PARTY_SIZE", &value)?;
        }
        if let Some(value) = read_env("MESA_RESERVATIONS_WRITE_ATTEMPTS") {
            self.reservations.write_attempts =
                parse_u32("MESA_RESERVATIONS_WRITE_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("MESA_RESERVATIONS_CANCELLED_RETENTION_DAYS") {
            self.reservations.cancelled_retention_days =
                parse_u32("MESA_RESERVATIONS_CANCELLED_RETENTION_DAYS", &value)?;
        }

        if let Some(value) = read_env("MESA_SESSION_WINDOW_TURNS") {
            self.session.window_turns = parse_u32("MESA_SESSION_WINDOW_TURNS", &value)?;
        }
        if let Some(value) = read_env("MESA_SESSION_DEDUP_RETENTION_SECS") {
            self.session.dedup_retention_secs =
                parse_u64("MESA_SESSION_DEDUP_RETENTION_SECS", &value)?;
        }
        if let Some(value) = read_env("MESA_SESSION_IDLE_RESET_MINUTES") {
            self.session.idle_reset_minutes =
                parse_u32("MESA_SESSION_IDLE_RESET_MINUTES", &value)?;
        }

        if let Some(value) = read_env("MESA_AGENT_RESTAURANT_NAME") {
            self.agent.restaurant_name = value;
        }
        if let Some(value) = read_env("MESA_AGENT_TIMEOUT_SECS") {
            self.agent.timeout_secs = parse_u64("MESA_AGENT_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("MESA_AGENT_API_KEY") {
            self.agent.api_key = Some(value.into());
        }

        if let Some(value) = read_env("MESA_MESSAGING_MAX_MESSAGE_LENGTH") {
            self.messaging.max_message_length =
                parse_u32("MESA_MESSAGING_MAX_MESSAGE_LENGTH", &value)? as usize;
        }

        if let Some(value) = read_env("MESA_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("MESA_SERVER_PORT").or_else(|| read_env("PORT")) {
            self.server.port = parse_u16("MESA_SERVER_PORT", &value)?;
        }
        let environment =
            read_env("MESA_SERVER_ENVIRONMENT").or_else(|| read_env("MESA_ENVIRONMENT"));
        if let Some(value) = environment {
            self.server.environment = value.parse()?;
        }
        if let Some(value) = read_env("MESA_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("MESA_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("MESA_SERVER_PURGE_INTERVAL_SECS") {
            self.server.purge_interval_secs =
                parse_u64("MESA_SERVER_PURGE_INTERVAL_SECS", &value)?;
        }

        let log_level = read_env("MESA_LOGGING_LEVEL").or_else(|| read_env("MESA_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("MESA_LOGGING_FORMAT").or_else(|| read_env("MESA_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        set(&mut self.database.url, overrides.database_url);
        set(&mut self.logging.level, overrides.log_level);
        set(&mut self.server.environment, overrides.environment);
        set(&mut self.server.port, overrides.port);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_reservations(&self.reservations)?;
        validate_session(&self.session)?;
        validate_agent(&self.agent)?;
        validate_messaging(&self.messaging)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("mesa.toml"), PathBuf::from("config/mesa.toml")]
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

/// Upper bound for reservation retention, roughly ten years.
pub const MAX_RETENTION_DAYS: u32 = 3_650;
pub const MAX_DEDUP_RETENTION_SECS: u64 = 30 * 24 * 60 * 60;

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let supported = url.starts_with("sqlite://")
        || url.starts_with("sqlite::")
        || url == ":memory:"
        || url == "memory://";
    if !supported {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, `:memory:`) or `memory://`"
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

    if database.call_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "database.call_timeout_ms must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_reservations(reservations: &ReservationsConfig) -> Result<(), ConfigError> {
    if reservations.bucket_capacity == 0 {
        return Err(ConfigError::Validation(
            "reservations.bucket_capacity must be greater than zero".to_string(),
        ));
    }
    if reservations.max_party_size == 0 {
        return Err(ConfigError::Validation(
            "reservations.max_party_size must be greater than zero".to_string(),
        ));
    }
    if reservations.write_attempts == 0 {
        return Err(ConfigError::Validation(
            "reservations.write_attempts must be at least 1".to_string(),
        ));
    }
    if reservations.cancelled_retention_days > MAX_RETENTION_DAYS
        || reservations.completed_retention_days > MAX_RETENTION_DAYS
    {
        return Err(ConfigError::Validation(format!(
            "reservations retention days must be at most {MAX_RETENTION_DAYS}"
        )));
    }
    if reservations.page_size == 0 || reservations.page_size > 1_000 {
        return Err(ConfigError::Validation(
            "reservations.page_size must be in range 1..=1000".to_string(),
        ));
    }
    Ok(())
}

fn validate_session(session: &SessionConfig) -> Result<(), ConfigError> {
    if session.window_turns == 0 {
        return Err(ConfigError::Validation(
            "session.window_turns must be greater than zero".to_string(),
        ));
    }
    if session.dedup_retention_secs == 0 || session.dedup_max_entries == 0 {
        return Err(ConfigError::Validation(
            "session.dedup_retention_secs and session.dedup_max_entries must be greater than zero"
                .to_string(),
        ));
    }
    if session.dedup_retention_secs > MAX_DEDUP_RETENTION_SECS {
        return Err(ConfigError::Validation(format!(
            "session.dedup_retention_secs must be at most {MAX_DEDUP_RETENTION_SECS} (30 days)"
        )));
    }
    if session.write_attempts == 0 {
        return Err(ConfigError::Validation(
            "session.write_attempts must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.timeout_secs == 0 || agent.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "agent.timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    if agent.restaurant_name.trim().is_empty() {
        return Err(ConfigError::Validation("agent.restaurant_name must not be empty".to_string()));
    }
    Ok(())
}

fn validate_messaging(messaging: &MessagingConfig) -> Result<(), ConfigError> {
    if messaging.max_message_length < 16 {
        return Err(ConfigError::Validation(
            "messaging.max_message_length must be at least 16 characters".to_string(),
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

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    reservations: Option<ReservationsPatch>,
    session: Option<SessionPatch>,
    agent: Option<AgentPatch>,
    messaging: Option<MessagingPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
    call_timeout_ms: Option<u64>,
    transient_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ReservationsPatch {
    bucket_capacity: Option<u32>,
    max_party_size: Option<u32>,
    write_attempts: Option<u32>,
    cancelled_retention_days: Option<u32>,
    completed_retention_days: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionPatch {
    window_turns: Option<u32>,
    dedup_retention_secs: Option<u64>,
    dedup_max_entries: Option<u32>,
    idle_reset_minutes: Option<u32>,
    write_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    restaurant_name: Option<String>,
    timeout_secs: Option<u64>,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagingPatch {
    max_message_length: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    environment: Option<Environment>,
    graceful_shutdown_secs: Option<u64>,
    purge_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
