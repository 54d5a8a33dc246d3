//! Configuration loading from file and environment variables.

use keystone_db::DbRuntimeSettings;
use serde::Deserialize;
use thiserror::Error;

/// Top-level inspector configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// What to report on.
    #[serde(default)]
    pub inspect: InspectConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path or SQLite URI of the database.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Busy timeout for SQLite connections, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// How long to wait for a pooled connection, in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "keystone_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Optional batched lookup to run against the database.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InspectConfig {
    /// Lookup by composite keys, reported alongside the engine limits.
    #[serde(default)]
    pub lookup: Option<LookupConfig>,
}

/// A `read_rows_by_ids` call described in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LookupConfig {
    /// `SELECT` without a `WHERE` clause.
    pub base_query: String,

    /// Boolean expression with one `?` per key value.
    pub per_id_filter: String,

    /// Extra condition ANDed with the key filter.
    #[serde(default)]
    pub static_filter: Option<String>,

    /// Values bound to the static filter's placeholders.
    #[serde(default)]
    pub static_params: Vec<serde_json::Value>,

    /// Composite keys, one array per key.
    #[serde(default)]
    pub keys: Vec<Vec<serde_json::Value>>,
}

fn default_db_path() -> String {
    "keystone.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DbRuntimeSettings::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    DbRuntimeSettings::default().pool_max_size
}

fn default_acquire_timeout_ms() -> u64 {
    DbRuntimeSettings::default().acquire_timeout_ms
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DatabaseConfig {
    /// Runtime settings for opening a `DatabaseContext`.
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
            acquire_timeout_ms: self.acquire_timeout_ms,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Where the configuration path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// First command-line argument.
    Argument,
    /// `KEYSTONE_CONFIG_PATH`.
    Environment,
    /// Neither was given; `config.toml` in the working directory.
    Default,
}

impl ConfigSource {
    /// Short label for log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Argument => "argument",
            Self::Environment => "environment",
            Self::Default => "default",
        }
    }
}

/// Picks the configuration file: the first non-blank of `argument` and
/// `KEYSTONE_CONFIG_PATH`, otherwise `config.toml`.
pub fn config_path(
    argument: Option<String>,
    var: impl Fn(&str) -> Option<String>,
) -> (String, ConfigSource) {
    let non_blank = |value: String| (!value.trim().is_empty()).then_some(value);

    if let Some(path) = argument.and_then(non_blank) {
        (path, ConfigSource::Argument)
    } else if let Some(path) = var("KEYSTONE_CONFIG_PATH").and_then(non_blank) {
        (path, ConfigSource::Environment)
    } else {
        (DEFAULT_CONFIG_PATH.to_string(), ConfigSource::Default)
    }
}

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Loads configuration from a TOML file and applies environment overrides.
///
/// A missing file is not an error; defaults are used instead. Environment
/// variable overrides:
/// - `KEYSTONE_DB_PATH` overrides `database.path`
/// - `KEYSTONE_POOL_MAX_SIZE` overrides `database.pool_max_size`
/// - `KEYSTONE_ACQUIRE_TIMEOUT_MS` overrides `database.acquire_timeout_ms`
/// - `KEYSTONE_LOG_LEVEL` overrides `logging.level`
/// - `KEYSTONE_LOG_JSON` overrides `logging.json` ("true" or "1" enables it)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let mut config = match read_if_present(path)? {
        Some(contents) => toml::from_str(&contents)?,
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn read_if_present(path: &str) -> Result<Option<String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path, "no configuration file, using defaults");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(db_path) = var("KEYSTONE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(size) = var("KEYSTONE_POOL_MAX_SIZE") {
        if let Ok(parsed) = size.parse() {
            config.database.pool_max_size = parsed;
        }
    }
    if let Some(timeout) = var("KEYSTONE_ACQUIRE_TIMEOUT_MS") {
        if let Ok(parsed) = timeout.parse() {
            config.database.acquire_timeout_ms = parsed;
        }
    }
    if let Some(level) = var("KEYSTONE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("KEYSTONE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.toml");
        let config =
            load_config(&path.to_string_lossy()).expect("missing file is not an error");

        assert_eq!(config.database.pool_max_size, 8);
        assert_eq!(config.logging.level, "info");
        assert!(config.inspect.lookup.is_none());
    }

    #[test]
    fn parses_database_and_lookup_tables() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "file:configured?mode=memory&cache=shared"
            pool_max_size = 2

            [logging]
            level = "debug"
            json = true

            [inspect.lookup]
            base_query = "SELECT id, name FROM rows"
            per_id_filter = "field1=? AND field2=?"
            static_filter = "field1<?"
            static_params = [40]
            keys = [[20, 11], [30, 11]]
            "#,
        )
        .expect("valid config");

        assert_eq!(config.database.pool_max_size, 2);
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert!(config.logging.json);

        let lookup = config.inspect.lookup.expect("lookup table");
        assert_eq!(lookup.keys.len(), 2);
        assert_eq!(lookup.static_params, vec![serde_json::json!(40)]);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[database\npath = 3").expect("write");

        let err = load_config(&path.to_string_lossy()).expect_err("parse should fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn config_path_prefers_argument_then_environment() {
        let env = |key: &str| {
            (key == "KEYSTONE_CONFIG_PATH").then(|| "/etc/keystone.toml".to_string())
        };
        let no_env = |_: &str| None;

        assert_eq!(
            config_path(Some("cli.toml".to_string()), env),
            ("cli.toml".to_string(), ConfigSource::Argument)
        );
        assert_eq!(
            config_path(Some("  ".to_string()), env),
            ("/etc/keystone.toml".to_string(), ConfigSource::Environment)
        );
        assert_eq!(
            config_path(None, no_env),
            ("config.toml".to_string(), ConfigSource::Default)
        );
    }

    #[test]
    fn environment_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("KEYSTONE_DB_PATH", "/tmp/override.db"),
            ("KEYSTONE_POOL_MAX_SIZE", "3"),
            ("KEYSTONE_ACQUIRE_TIMEOUT_MS", "not-a-number"),
            ("KEYSTONE_LOG_JSON", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.database.path, "/tmp/override.db");
        assert_eq!(config.database.pool_max_size, 3);
        assert_eq!(config.database.acquire_timeout_ms, 30_000);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }
}
