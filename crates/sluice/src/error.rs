use std::fmt;
use std::panic::Location;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::ledger::MigrationGroup;
use crate::solver::SolverError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("schema inspection failed: {0}")]
    Inspection(#[source] tokio_postgres::Error),

    #[error("migrations table {table} is locked by another process")]
    Locked { table: String },

    #[error("migration {name} failed at {}: {source}", .source.location())]
    Migration {
        name: String,
        /// The group as recorded so far, including the failed migration
        group: MigrationGroup,
        source: MigrationError,
    },

    #[error("migration {name} is recorded as applied but is not registered")]
    UnknownMigration { name: String },

    #[error("changeset cannot be applied: {0}")]
    Solver(#[from] SolverError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid migration file {path}: {reason}")]
    InvalidMigrationFile { path: Utf8PathBuf, reason: String },
}

impl Error {
    /// Whether this error means another process holds the migration lock.
    pub fn is_locked(&self) -> bool {
        matches!(self, Error::Locked { .. })
    }
}

/// Error returned from a migration body.
///
/// Conversions into `MigrationError` are `#[track_caller]`, so an error
/// propagated with `?` remembers where in the migration it happened.
#[derive(Debug)]
pub struct MigrationError {
    message: String,
    location: &'static Location<'static>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl MigrationError {
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: Location::caller(),
            source: None,
        }
    }

    #[track_caller]
    fn wrap(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: source.to_string(),
            location: Location::caller(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Where the error was created or converted.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<tokio_postgres::Error> for MigrationError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> Self {
        Self::wrap(err)
    }
}

impl From<std::io::Error> for MigrationError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::wrap(err)
    }
}

impl From<Error> for MigrationError {
    #[track_caller]
    fn from(err: Error) -> Self {
        Self::wrap(err)
    }
}

impl From<String> for MigrationError {
    #[track_caller]
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for MigrationError {
    #[track_caller]
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
