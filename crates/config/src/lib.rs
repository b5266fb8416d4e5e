use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// `AppConfig` holds all configuration parameters required by the settlement binary.
///
/// The configuration is loaded from environment variables (optionally via a `.env` file)
/// or uses default values if the variable is not set. Variable names are the upper-case
/// field names, e.g. `DB_HOST` or `SETTLE_TIMEOUT`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    // --- Database settings ---
    /// Database hostname or service name.
    pub db_host: String,
    /// Database port (default: 5432).
    pub db_port: u16,
    /// Database user.
    pub db_user: String,
    /// Database password.
    pub db_password: String,
    /// Database name.
    pub db_name: String,
    /// Maximum number of pooled connections.
    pub db_pool_size: usize,
    /// Directory holding the `.sql` migration files, applied in file-name order.
    pub migrations_dir: String,

    // --- Settlement ---
    /// Fail immediately on row-lock contention instead of waiting.
    pub lock_no_wait: bool,
    /// Upper bound for one settlement (human-friendly format, e.g. "5s"); "0s" disables it.
    #[serde(deserialize_with = "deserialize_duration")]
    pub settle_timeout: Duration,
}

/// Custom deserializer for durations.
/// Accepts human-readable formats like "5s", "1m", etc.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

impl AppConfig {
    /// Loads configuration from environment variables (and optionally from `.env` file).
    ///
    /// Fields not set via env will be filled with default values.
    ///
    /// # Errors
    /// Returns an error if environment variables are invalid or missing required values.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            // Database
            .set_default("db_host", "localhost")?
            .set_default("db_port", 5432)?
            .set_default("db_user", "cashier")?
            .set_default("db_password", "cashier")?
            .set_default("db_name", "cashier")?
            .set_default("db_pool_size", 16)?
            .set_default("migrations_dir", "migrations")?
            // Settlement
            .set_default("lock_no_wait", false)?
            .set_default("settle_timeout", "5s")?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to load configuration")
    }

    /// Postgres connection string built from the `db_*` fields.
    pub fn dsn(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} sslmode=disable",
            self.db_host, self.db_port, self.db_user, self.db_password, self.db_name
        )
    }

    /// `None` when the timeout is disabled.
    pub fn settle_timeout(&self) -> Option<Duration> {
        (!self.settle_timeout.is_zero()).then_some(self.settle_timeout)
    }
}
