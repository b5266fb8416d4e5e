//! Database initialization and migration logic for the settlement service.
//!
//! Provides `init_db_pool` for creating a connection pool and `run_migrations`
//! for applying the SQL files of the migrations directory in file-name order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use app_config::AppConfig;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio::fs;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::info;

/// Initializes the database connection pool.
///
/// # Arguments
/// * `cfg` - The loaded application configuration.
///
/// # Returns
/// * `Pool` - A pool of PostgreSQL connections, ready for async use.
///
/// # Errors
/// Returns an error if the DSN is invalid or the pool cannot be created.
pub fn init_db_pool(cfg: &AppConfig) -> Result<Pool> {
    let pg_config: PgConfig = cfg.dsn().parse().context("Failed to parse Postgres DSN")?;

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Pool::builder(mgr)
        .max_size(cfg.db_pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .context("Failed to create database pool")
}

/// Applies every `.sql` file of `migrations_dir` that has not been applied yet.
///
/// Applied file names are recorded in `schema_migrations`; each file runs in
/// its own transaction together with its bookkeeping row.
///
/// # Errors
/// Returns an error if migration files cannot be read or applied.
pub async fn run_migrations(client: &mut Client, migrations_dir: &str) -> Result<usize> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .await
        .context("Failed to create schema_migrations table")?;

    let mut applied = 0;
    for path in migration_files(Path::new(migrations_dir)).await? {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let done = client
            .query_opt("SELECT 1 FROM schema_migrations WHERE name = $1", &[&file_name])
            .await
            .context("Failed to read schema_migrations")?;
        if done.is_some() {
            continue;
        }

        info!("Applying migration: {}", file_name);
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read migration file {}", file_name))?;

        let tx = client.transaction().await.context("Failed to begin migration")?;
        tx.batch_execute(&content)
            .await
            .with_context(|| format!("Failed to execute migration {}", file_name))?;
        tx.execute("INSERT INTO schema_migrations (name) VALUES ($1)", &[&file_name])
            .await
            .with_context(|| format!("Failed to record migration {}", file_name))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit migration {}", file_name))?;
        applied += 1;
    }
    Ok(applied)
}

/// `.sql` files of `dir`, sorted by file name.
pub async fn migration_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read migrations directory {}", dir.display()))?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sql") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migration_files_are_sorted_and_filtered() {
        let dir = std::env::temp_dir().join(format!("db-migrations-{}", std::process::id()));
        fs::create_dir_all(&dir).await.unwrap();
        for name in ["0002_orders.sql", "0001_init.sql", "README.md"] {
            fs::write(dir.join(name), "SELECT 1;").await.unwrap();
        }

        let files = migration_files(&dir).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["0001_init.sql", "0002_orders.sql"]);

        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn pool_uses_configured_size() {
        let cfg = AppConfig {
            db_host: "localhost".into(),
            db_port: 5432,
            db_user: "cashier".into(),
            db_password: "cashier".into(),
            db_name: "cashier".into(),
            db_pool_size: 4,
            migrations_dir: "migrations".into(),
            lock_no_wait: false,
            settle_timeout: std::time::Duration::from_secs(5),
        };
        let pool = init_db_pool(&cfg).unwrap();
        assert_eq!(pool.status().max_size, 4);
    }
}
