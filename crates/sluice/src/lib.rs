//! Schema migrations for Postgres.
//!
//! sluice keeps a database schema in step with what an application expects.
//! It supports three ways of getting there:
//!
//! - **Versioned migrations**: named up/down steps, applied in name order and
//!   recorded in a ledger table. Steps are Rust functions, raw SQL, or a list of
//!   schema [`Operation`]s.
//! - **SQL files**: `<name>.up.sql` / `<name>.down.sql` pairs discovered from a
//!   directory with [`Migrations::discover`].
//! - **Auto-migration**: [`AutoMigrator`] inspects the live database, diffs it
//!   against a desired [`State`] and applies the difference.
//!
//! Every migrate or rollback run happens while holding a lock row in a
//! companion locks table, so two processes never migrate the same database at
//! once.
//!
//! # Writing a migration
//!
//! ```ignore
//! use sluice::{Migration, MigrationContext, MigrationResult};
//!
//! fn create_user<'a>(ctx: &'a MigrationContext<'a>) -> sluice::BoxFuture<'a, MigrationResult<()>> {
//!     Box::pin(async move {
//!         ctx.execute("CREATE TABLE \"user\" (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL)").await?;
//!         Ok(())
//!     })
//! }
//!
//! fn drop_user<'a>(ctx: &'a MigrationContext<'a>) -> sluice::BoxFuture<'a, MigrationResult<()>> {
//!     Box::pin(async move {
//!         ctx.execute("DROP TABLE \"user\"").await?;
//!         Ok(())
//!     })
//! }
//!
//! sluice::inventory::submit!(Migration::new("20260101120000_create_user", create_user, drop_user));
//! ```
//!
//! Use `MigrationResult` instead of `Result` in migration bodies: the `?`
//! operator then records the file, line and column the error came from.
//!
//! # Running migrations
//!
//! ```ignore
//! let mut migrator = Migrator::new(&client, Migrations::registered(), LedgerConfig::default());
//! migrator.init().await?;
//! let group = migrator.run().await?;
//! ```

use std::future::Future;
use std::pin::Pin;

mod auto;
mod dialect;
mod diff;
mod error;
mod inspect;
mod ledger;
mod migrate;
mod operation;
pub mod solver;
mod traced;

pub use auto::{AutoMigrator, AutoMigratorConfig, Plan, SqlMigrationFiles};
pub use dialect::{Dialect, PgDialect};
pub use diff::{Detector, diff};
pub use error::{Error, MigrationError};
pub use inspect::Inspector;
pub use ledger::{
    AppliedMigration, Ledger, LedgerConfig, MigrationGroup, PgLedger, with_lock,
};
pub use migrate::{Migration, MigrationContext, MigrationStatus, Migrations, Migrator, Step};
pub use operation::{Changeset, Diagnostic, Operation};
pub use solver::{SolverError, VirtualSchema};
pub use traced::{Connection, ConnectionExt, TracedConn};

pub use sluice_schema::{
    Column, ForeignKey, ForeignKeyRef, State, Table, TableDef, TableId, normalize_sql_type,
};

// Re-exported for `inventory::submit!` in downstream crates.
pub use inventory;

/// Result type for sluice operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for migration bodies, captures the caller location on error.
pub type MigrationResult<T> = std::result::Result<T, MigrationError>;

/// A boxed, sendable future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type alias for migration functions.
///
/// A migration function borrows a [`MigrationContext`] and returns a boxed
/// future. Plain `fn` pointers keep [`Migration`] constructible in a `const`
/// context, which `inventory::submit!` requires.
pub type MigrationFn = for<'a> fn(&'a MigrationContext<'a>) -> BoxFuture<'a, MigrationResult<()>>;
