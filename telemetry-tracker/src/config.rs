use anyhow::{Context, Result};
use config::{Config as ConfigLoader, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;
use telemetry_tracker_api::observability::ObservabilityConfig;
use telemetry_tracker_storage::PostgresConfig;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub database: DatabaseSettings,
    pub observability: ObservabilityConfig,
    /// How long in-flight requests may run after a shutdown signal
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    /// Full DSN; takes precedence over the individual settings
    pub url: Option<String>,
    pub run_migrations: bool,
    pub pool: PostgresConfig,
}

impl Config {
    /// Load from `config/default` and `config/local` files, `TRACKER__*`
    /// variables, then the service's legacy variables (`APP_PORT`, `DB_*`,
    /// `DATABASE_URL`).
    pub fn load() -> Result<Self> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("TRACKER").separator("__"))
            .set_override_option("port", env::var("APP_PORT").ok())?
            .set_override_option("database.host", env::var("DB_HOST").ok())?
            .set_override_option("database.port", env::var("DB_PORT").ok())?
            .set_override_option("database.user", env::var("DB_USER").ok())?
            .set_override_option("database.password", env::var("DB_PASSWORD").ok())?
            .set_override_option("database.name", env::var("DB_NAME").ok())?
            .set_override_option("database.url", env::var("DATABASE_URL").ok())?
            .build()
            .context("failed to read configuration")?;

        config
            .try_deserialize()
            .context("invalid configuration (ports must be integers)")
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Pool settings with the resolved DSN
    pub fn postgres(&self) -> PostgresConfig {
        PostgresConfig {
            database_url: self.database.url(),
            ..self.database.pool.clone()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database: DatabaseSettings::default(),
            observability: ObservabilityConfig::default(),
            shutdown_grace_secs: 15,
        }
    }
}

impl DatabaseSettings {
    /// `url` when set, otherwise a DSN assembled from the parts
    pub fn url(&self) -> String {
        match &self.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!(
                "postgres://{}:{}@{}:{}/{}?sslmode=disable",
                self.user, self.password, self.host, self.port, self.name
            ),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            name: "telemetry".to_string(),
            url: None,
            run_migrations: false,
            pool: PostgresConfig::default(),
        }
    }
}
