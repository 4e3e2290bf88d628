//! Connection and ledger settings.
//!
//! Every setting comes from a flag or its environment variable; `.env` is
//! loaded before parsing, so it can provide them too.

use camino::Utf8PathBuf;
use clap::Args;
use deadpool_postgres::{CreatePoolError, Pool, Runtime};
use sluice::LedgerConfig;
use tokio_postgres::NoTls;

#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Database connection URL
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Table recording applied migrations
    #[arg(
        long,
        global = true,
        env = "SLUICE_MIGRATIONS_TABLE",
        default_value = "sluice_migrations"
    )]
    pub migrations_table: String,

    /// Table holding the migration lock
    #[arg(
        long,
        global = true,
        env = "SLUICE_LOCKS_TABLE",
        default_value = "sluice_migration_locks"
    )]
    pub locks_table: String,

    /// Directory of `.up.sql` / `.down.sql` migrations
    #[arg(
        long,
        global = true,
        env = "SLUICE_MIGRATIONS_DIR",
        default_value = "migrations"
    )]
    pub migrations_dir: Utf8PathBuf,
}

impl Config {
    pub fn ledger(&self) -> LedgerConfig {
        LedgerConfig::default()
            .with_migrations_table(&self.migrations_table)
            .with_locks_table(&self.locks_table)
    }

    /// Build a connection pool for `database_url`.
    pub fn pool(&self) -> Result<Pool, ConfigError> {
        let url = self
            .database_url
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseUrl)?;
        tracing::debug!(database = %mask_password(url), "creating pool");

        let config = deadpool_postgres::Config {
            url: Some(url.to_string()),
            ..Default::default()
        };
        Ok(config.create_pool(Some(Runtime::Tokio1), NoTls)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no database URL: pass --database-url or set DATABASE_URL")]
    MissingDatabaseUrl,

    #[error("invalid database configuration: {0}")]
    Pool(#[from] CreatePoolError),
}

/// Mask the password in a database URL for display.
pub fn mask_password(url: &str) -> String {
    if let Some(start) = url.find("://") {
        if let Some(at) = url.rfind('@') {
            if at > start {
                let credentials = &url[start + 3..at];
                if let Some(colon) = credentials.find(':') {
                    let user = &credentials[..colon];
                    return format!("{}{}:***{}", &url[..start + 3], user, &url[at..]);
                }
            }
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_password() {
        assert_eq!(
            mask_password("postgres://app:hunter2@db:5432/app"),
            "postgres://app:***@db:5432/app"
        );
        assert_eq!(
            mask_password("postgres://app@db/app"),
            "postgres://app@db/app"
        );
        assert_eq!(mask_password("host=db user=app"), "host=db user=app");
    }

    #[test]
    fn test_ledger_tables() {
        let config = Config {
            database_url: None,
            migrations_table: "schema_history".into(),
            locks_table: "schema_lock".into(),
            migrations_dir: "db/migrations".into(),
        };
        let ledger = config.ledger();
        assert_eq!(ledger.migrations_table, "schema_history");
        assert_eq!(ledger.locks_table, "schema_lock");
    }

    #[test]
    fn test_pool_requires_url() {
        let config = Config {
            database_url: None,
            migrations_table: "m".into(),
            locks_table: "l".into(),
            migrations_dir: "migrations".into(),
        };
        assert!(matches!(
            config.pool(),
            Err(ConfigError::MissingDatabaseUrl)
        ));
    }
}
