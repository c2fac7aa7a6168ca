//! Application configuration module
//!
//! Settings are layered: `.env`, `config/default.toml`, `config/<profile>.toml`,
//! `GATE_*` environment variables, then command-line overrides. The result is
//! an explicit value handed to the gate; nothing downstream reads the
//! environment.

use crate::schema::is_identifier;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load environment variables: {0}")]
    EnvLoad(#[from] dotenvy::Error),

    #[error("Missing required setting: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Database configuration for the database-backed migration log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub require_tls: bool,
    pub max_pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            require_tls: false,
            max_pool_size: 1,
        }
    }
}

/// Where the applied migration log is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSourceConfig {
    /// `<root>/<app>/NNNN_name.json`
    Directory(PathBuf),
    /// A migrations table in PostgreSQL
    Database { database: DatabaseConfig, table: String },
}

/// File-level settings, as deserialized by the `config` crate
#[derive(Debug, Clone, Deserialize)]
struct RawSettings {
    models: PathBuf,
    migrations: PathBuf,
    #[serde(default)]
    apps: Vec<String>,
    #[serde(default)]
    distinct_exit_codes: bool,
    migrations_table: String,
    #[serde(default)]
    database_url: Option<String>,
}

/// Values supplied on the command line; `None` leaves the layered value alone
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub models: Option<PathBuf>,
    pub migrations: Option<PathBuf>,
    pub database_url: Option<String>,
    pub apps: Vec<String>,
    pub distinct_exit_codes: bool,
}

/// Complete gate settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub profile: String,
    /// Declared model manifest
    pub models: PathBuf,
    pub log_source: LogSourceConfig,
    /// Restrict the check to these app labels; empty means every app
    pub apps: Vec<String>,
    pub distinct_exit_codes: bool,
}

impl Settings {
    /// Load `.env` into the process environment; a missing file is fine
    pub fn load_env() -> Result<(), ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) => Ok(()),
            Err(e) if e.not_found() => Ok(()),
            Err(e) => Err(ConfigError::EnvLoad(e)),
        }
    }

    /// Load settings for a profile from `./config` and the environment
    pub fn load(profile: &str, overrides: Overrides) -> Result<Self, ConfigError> {
        Self::load_from(Path::new("config"), profile, overrides)
    }

    /// Load settings from an explicit config directory
    pub fn load_from(dir: &Path, profile: &str, mut overrides: Overrides) -> Result<Self, ConfigError> {
        if overrides.database_url.is_none() {
            overrides.database_url = std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty());
        }
        if !is_identifier(profile) {
            return Err(ConfigError::InvalidValue(format!("invalid profile name '{}'", profile)));
        }

        let raw: RawSettings = config::Config::builder()
            .set_default("models", "models.json")?
            .set_default("migrations", "migrations")?
            .set_default("migrations_table", "gate_migrations")?
            .add_source(config::File::with_name(&dir.join("default").to_string_lossy()).required(false))
            .add_source(config::File::with_name(&dir.join(profile).to_string_lossy()).required(false))
            .add_source(
                config::Environment::with_prefix("GATE")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("apps")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Self::resolve(profile, raw, overrides)
    }

    fn resolve(profile: &str, raw: RawSettings, overrides: Overrides) -> Result<Self, ConfigError> {
        if !is_identifier(&raw.migrations_table) {
            return Err(ConfigError::InvalidValue(format!(
                "migrations_table '{}' is not a plain identifier",
                raw.migrations_table
            )));
        }

        // CLI or DATABASE_URL first, then the profile file
        let log_source = match overrides.database_url.or(raw.database_url) {
            Some(url) => LogSourceConfig::Database {
                database: Self::parse_database_url(&url)?,
                table: raw.migrations_table,
            },
            None => LogSourceConfig::Directory(overrides.migrations.unwrap_or(raw.migrations)),
        };

        let apps = if overrides.apps.is_empty() { raw.apps } else { overrides.apps };
        let apps: Vec<String> = apps
            .into_iter()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
        if let Some(bad) = apps.iter().find(|a| !is_identifier(a)) {
            return Err(ConfigError::InvalidValue(format!("invalid app label '{}'", bad)));
        }

        Ok(Self {
            profile: profile.to_string(),
            models: overrides.models.unwrap_or(raw.models),
            log_source,
            apps,
            distinct_exit_codes: overrides.distinct_exit_codes || raw.distinct_exit_codes,
        })
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    pub fn parse_database_url(url: &str) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue("Invalid DATABASE_URL format (expected postgresql://...)".to_string())
        })?;

        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            return Err(ConfigError::InvalidValue(format!(
                "Unsupported database scheme '{}'",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(ConfigError::MissingVar("database name in DATABASE_URL".to_string()));
        }

        let require_tls = parsed
            .query_pairs()
            .any(|(k, v)| k == "sslmode" && (v == "require" || v == "verify-full" || v == "verify-ca"));

        Ok(DatabaseConfig {
            host,
            port: parsed.port().unwrap_or(5432),
            user: parsed.username().to_string(),
            password: parsed.password().map(|p| p.to_string()).unwrap_or_default(),
            database,
            require_tls,
            max_pool_size: 1,
        })
    }
}
