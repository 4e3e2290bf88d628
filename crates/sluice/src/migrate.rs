//! Versioned migrations and the migrator that applies them.
//!
//! Migrations are applied in name order, so names should sort chronologically
//! (sluice generates `YYYYMMDDHHMMSS…` prefixes). Each `migrate` run assigns
//! the migrations it applies a new group id; `rollback` undoes the most recent
//! group as a unit.
//!
//! A migration is recorded in the ledger *before* its `up` step runs. Function
//! and SQL steps then run in their own transaction, unless the migration opts
//! out with [`Migration::without_transaction`] (or a `.notx` file name, see
//! [`Migrations::discover`]). Operation steps, which is what auto-migrations
//! use, run statement by statement without one.
//!
//! When a step fails the run stops, and the failed migration stays recorded as
//! part of the group, so rolling back the group also runs the failed
//! migration's `down` step. `down` steps should therefore tolerate an `up`
//! that was only partially applied, or not at all.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;

use camino::Utf8Path;
use futures_util::FutureExt;
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;
use tracing::Instrument;

use crate::dialect::{Dialect, PgDialect};
use crate::ledger::{AppliedMigration, Ledger, LedgerConfig, MigrationGroup, PgLedger, with_lock};
use crate::operation::Changeset;
use crate::traced::{Connection, ConnectionExt};
use crate::{Error, MigrationError, MigrationFn, MigrationResult, Result};

/// One direction of a migration.
#[derive(Debug, Clone)]
pub enum Step {
    /// Nothing to do.
    Noop,
    /// A Rust function.
    Func(MigrationFn),
    /// Raw SQL, possibly several `;`-separated statements.
    Sql(Cow<'static, str>),
    /// Schema operations, rendered by the migrator's dialect.
    Operations(Changeset),
}

/// A named migration with an `up` and a `down` step.
#[derive(Debug, Clone)]
pub struct Migration {
    pub name: Cow<'static, str>,
    pub comment: Cow<'static, str>,
    pub up: Step,
    pub down: Step,
    /// Run function and SQL steps inside `BEGIN` / `COMMIT`.
    pub transactional: bool,
}

impl Migration {
    /// A migration backed by two functions. Usable in `inventory::submit!`.
    pub const fn new(name: &'static str, up: MigrationFn, down: MigrationFn) -> Self {
        Self {
            name: Cow::Borrowed(name),
            comment: Cow::Borrowed(""),
            up: Step::Func(up),
            down: Step::Func(down),
            transactional: true,
        }
    }

    /// A migration backed by SQL text. Blank SQL becomes [`Step::Noop`].
    pub fn sql(name: impl Into<String>, up: impl Into<String>, down: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            comment: Cow::Borrowed(""),
            up: sql_step(up.into()),
            down: sql_step(down.into()),
            transactional: true,
        }
    }

    /// A migration backed by two changesets.
    pub fn operations(name: impl Into<String>, up: Changeset, down: Changeset) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            comment: Cow::Borrowed(""),
            up: Step::Operations(up),
            down: Step::Operations(down),
            transactional: false,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Cow::Owned(comment.into());
        self
    }

    /// Run the steps outside a transaction, for statements Postgres refuses
    /// inside one (`CREATE INDEX CONCURRENTLY`, `ALTER TYPE ... ADD VALUE`).
    pub const fn without_transaction(mut self) -> Self {
        self.transactional = false;
        self
    }
}

fn sql_step(sql: String) -> Step {
    if sql.trim().is_empty() {
        Step::Noop
    } else {
        Step::Sql(Cow::Owned(sql))
    }
}

inventory::collect!(Migration);

/// A set of migrations keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Migrations {
    migrations: BTreeMap<String, Migration>,
}

impl Migrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every migration registered with `inventory::submit!`.
    pub fn registered() -> Self {
        let mut migrations = Self::new();
        for migration in inventory::iter::<Migration> {
            migrations.add(migration.clone());
        }
        migrations
    }

    /// Load `<name>.up.sql` / `<name>.down.sql` pairs from a directory.
    ///
    /// Other files are ignored. A missing `.down.sql` means the migration
    /// has no down step; a `.down.sql` without its `.up.sql` is an error.
    /// The comment is the part of the name after the first `_`.
    ///
    /// `<name>.notx.up.sql` runs without a transaction.
    pub fn discover(dir: impl AsRef<Utf8Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut ups: BTreeMap<String, String> = BTreeMap::new();
        let mut downs: BTreeMap<String, String> = BTreeMap::new();
        let mut no_tx: HashSet<String> = HashSet::new();

        for entry in dir.read_dir_utf8()? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let (name, target) = if let Some(name) = file_name.strip_suffix(".up.sql") {
                (name, &mut ups)
            } else if let Some(name) = file_name.strip_suffix(".down.sql") {
                (name, &mut downs)
            } else {
                continue;
            };
            let name = match name.strip_suffix(".notx") {
                Some(name) => {
                    no_tx.insert(name.to_string());
                    name
                }
                None => name,
            };
            if name.is_empty() {
                return Err(Error::InvalidMigrationFile {
                    path: entry.path().to_owned(),
                    reason: "file name has no migration name".to_string(),
                });
            }
            target.insert(name.to_string(), std::fs::read_to_string(entry.path())?);
        }

        if let Some(orphan) = downs.keys().find(|name| !ups.contains_key(*name)) {
            return Err(Error::InvalidMigrationFile {
                path: dir.join(format!("{orphan}.down.sql")),
                reason: format!("no matching {orphan}.up.sql"),
            });
        }

        let mut migrations = Self::new();
        for (name, up) in ups {
            let down = downs.remove(&name).unwrap_or_default();
            let comment = name.split_once('_').map(|(_, c)| c.to_string());
            let transactional = !no_tx.contains(&name);
            let mut migration = Migration::sql(name, up, down);
            if let Some(comment) = comment {
                migration = migration.with_comment(comment);
            }
            if !transactional {
                migration = migration.without_transaction();
            }
            migrations.add(migration);
        }
        tracing::debug!(dir = %dir, count = migrations.len(), "discovered sql migrations");
        Ok(migrations)
    }

    /// Add a migration, replacing any migration with the same name.
    pub fn add(&mut self, migration: Migration) {
        let name = migration.name.to_string();
        if self.migrations.insert(name.clone(), migration).is_some() {
            tracing::warn!(migration = %name, "duplicate migration name, keeping the last one");
        }
    }

    /// Builder-style [`Migrations::add`].
    pub fn with(mut self, migration: Migration) -> Self {
        self.add(migration);
        self
    }

    /// Add every migration from `other`.
    pub fn extend(&mut self, other: Migrations) {
        for migration in other.migrations.into_values() {
            self.add(migration);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Migration> {
        self.migrations.get(name)
    }

    /// Migrations in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

/// What a migration step gets to work with.
pub struct MigrationContext<'a> {
    conn: &'a dyn Connection,
    dialect: &'a dyn Dialect,
    name: &'a str,
}

impl<'a> MigrationContext<'a> {
    pub fn new(conn: &'a dyn Connection, dialect: &'a dyn Dialect, name: &'a str) -> Self {
        Self {
            conn,
            dialect,
            name,
        }
    }

    /// Name of the migration being run.
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn dialect(&self) -> &'a dyn Dialect {
        self.dialect
    }

    pub fn connection(&self) -> &'a dyn Connection {
        self.conn
    }

    /// Execute one statement without parameters.
    pub async fn execute(&self, sql: &str) -> std::result::Result<u64, tokio_postgres::Error> {
        self.conn.traced().execute(sql, &[]).await
    }

    /// Execute one statement with parameters.
    pub async fn execute_with(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> std::result::Result<u64, tokio_postgres::Error> {
        self.conn.traced().execute(sql, params).await
    }

    /// Run several `;`-separated statements.
    pub async fn batch_execute(&self, sql: &str) -> std::result::Result<(), tokio_postgres::Error> {
        self.conn.traced().batch_execute(sql).await
    }

    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> std::result::Result<Vec<Row>, tokio_postgres::Error> {
        self.conn.traced().query(sql, params).await
    }

    /// Render and execute a changeset, one statement at a time.
    pub async fn apply(&self, changes: &Changeset) -> MigrationResult<()> {
        let total = changes.len();
        for (done, op) in changes.iter().enumerate() {
            for sql in self.dialect.render(op) {
                if let Err(e) = self.execute(&sql).await {
                    return Err(MigrationError::new(format!(
                        "operation {}/{total} `{op}` failed after {done} applied: {e}",
                        done + 1
                    )));
                }
            }
        }
        Ok(())
    }

    /// Run a step, inside a transaction when `transactional` and the step
    /// is a function or SQL.
    async fn run(&self, step: &Step, transactional: bool) -> MigrationResult<()> {
        if !transactional || !matches!(step, Step::Func(_) | Step::Sql(_)) {
            return self.run_step(step).await;
        }

        self.batch_execute("BEGIN").await?;
        let outcome = AssertUnwindSafe(self.run_step(step)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {
                self.batch_execute("COMMIT").await?;
                Ok(())
            }
            Ok(Err(err)) => {
                self.rollback_transaction().await;
                Err(err)
            }
            Err(panic) => {
                self.rollback_transaction().await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn rollback_transaction(&self) {
        if let Err(e) = self.batch_execute("ROLLBACK").await {
            tracing::error!(migration = %self.name, error = %e, "failed to roll back transaction");
        }
    }

    async fn run_step(&self, step: &Step) -> MigrationResult<()> {
        match step {
            Step::Noop => Ok(()),
            Step::Func(f) => f(self).await,
            Step::Sql(sql) => {
                self.batch_execute(sql).await?;
                Ok(())
            }
            Step::Operations(changes) => self.apply(changes).await,
        }
    }
}

/// Status of one migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub name: String,
    pub comment: String,
    /// Ledger row, if applied
    pub applied: Option<AppliedMigration>,
    /// Whether the migration is known to this migrator
    pub registered: bool,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.applied.is_some()
    }
}

/// Applies and rolls back [`Migrations`], recording progress in a [`Ledger`].
pub struct Migrator<'a, L: Ledger = PgLedger<'a>> {
    conn: &'a dyn Connection,
    dialect: Box<dyn Dialect>,
    ledger: L,
    migrations: Migrations,
}

impl<'a> Migrator<'a, PgLedger<'a>> {
    /// A migrator using the Postgres ledger.
    pub fn new(conn: &'a dyn Connection, migrations: Migrations, config: LedgerConfig) -> Self {
        Self::with_ledger(conn, PgLedger::new(conn, config), migrations)
    }
}

impl<'a, L: Ledger> Migrator<'a, L> {
    pub fn with_ledger(conn: &'a dyn Connection, ledger: L, migrations: Migrations) -> Self {
        Self {
            conn,
            dialect: Box::new(PgDialect),
            ledger,
            migrations,
        }
    }

    /// Use another dialect for [`Step::Operations`].
    pub fn with_dialect(mut self, dialect: impl Dialect + 'static) -> Self {
        self.dialect = Box::new(dialect);
        self
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn migrations(&self) -> &Migrations {
        &self.migrations
    }

    pub fn migrations_mut(&mut self) -> &mut Migrations {
        &mut self.migrations
    }

    /// Create the ledger tables if needed.
    pub async fn init(&self) -> Result<()> {
        self.ledger.init().await
    }

    /// Drop and recreate the ledger tables.
    pub async fn reset(&self) -> Result<()> {
        self.ledger.reset().await
    }

    pub async fn lock(&self) -> Result<()> {
        self.ledger.lock().await
    }

    pub async fn unlock(&self) -> Result<()> {
        self.ledger.unlock().await
    }

    /// Run `body` while holding the migration lock. See [`with_lock`].
    pub async fn run_locked<T>(&self, body: impl Future<Output = Result<T>>) -> Result<T> {
        with_lock(&self.ledger, body).await
    }

    /// Initialize the ledger, then migrate while holding the lock.
    pub async fn run(&self) -> Result<MigrationGroup> {
        self.init().await?;
        self.run_locked(self.migrate()).await
    }

    /// Apply all pending migrations as one new group.
    ///
    /// Does not take the lock; use [`Migrator::run`] or
    /// [`Migrator::run_locked`] when other processes may migrate concurrently.
    pub async fn migrate(&self) -> Result<MigrationGroup> {
        let applied = self.ledger.applied().await?;
        let applied_names: HashSet<&str> = applied.iter().map(|m| m.name.as_str()).collect();
        let pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| !applied_names.contains(m.name.as_ref()))
            .collect();

        if pending.is_empty() {
            tracing::info!("database is up to date");
            return Ok(MigrationGroup::default());
        }

        let mut group = MigrationGroup {
            id: applied.iter().map(|m| m.group_id).max().unwrap_or(0) + 1,
            migrations: Vec::with_capacity(pending.len()),
        };

        for migration in pending {
            let name = migration.name.as_ref();
            self.ledger.mark_applied(name, group.id).await?;
            group.migrations.push(name.to_string());

            let span = tracing::info_span!(
                "migration.up",
                migration = %name,
                group = group.id,
                dialect = self.dialect.name(),
            );
            let ctx = MigrationContext::new(self.conn, self.dialect.as_ref(), name);
            let outcome = ctx
                .run(&migration.up, migration.transactional)
                .instrument(span)
                .await;
            if let Err(source) = outcome {
                tracing::error!(migration = %name, error = %source, "migration failed");
                return Err(Error::Migration {
                    name: name.to_string(),
                    group,
                    source,
                });
            }
            tracing::info!(migration = %name, group = group.id, "applied migration");
        }

        Ok(group)
    }

    /// Roll back the most recent group, newest migration first.
    ///
    /// Every migration in the group must be registered; otherwise nothing is
    /// rolled back and [`Error::UnknownMigration`] is returned.
    pub async fn rollback(&self) -> Result<MigrationGroup> {
        let applied = self.ledger.applied().await?;
        let Some(last) = applied.iter().map(|m| m.group_id).max() else {
            tracing::info!("nothing to roll back");
            return Ok(MigrationGroup::default());
        };

        let mut names: Vec<String> = applied
            .into_iter()
            .filter(|m| m.group_id == last)
            .map(|m| m.name)
            .collect();
        names.sort();

        let mut migrations = Vec::with_capacity(names.len());
        for name in &names {
            match self.migrations.get(name) {
                Some(m) => migrations.push(m),
                None => return Err(Error::UnknownMigration { name: name.clone() }),
            }
        }

        let group = MigrationGroup {
            id: last,
            migrations: names,
        };

        for migration in migrations.into_iter().rev() {
            let name = migration.name.as_ref();
            let span = tracing::info_span!(
                "migration.down",
                migration = %name,
                group = group.id,
                dialect = self.dialect.name(),
            );
            let ctx = MigrationContext::new(self.conn, self.dialect.as_ref(), name);
            let outcome = ctx
                .run(&migration.down, migration.transactional)
                .instrument(span)
                .await;
            if let Err(source) = outcome {
                tracing::error!(migration = %name, error = %source, "rollback failed");
                return Err(Error::Migration {
                    name: name.to_string(),
                    group,
                    source,
                });
            }
            self.ledger.mark_unapplied(name).await?;
            tracing::info!(migration = %name, group = group.id, "rolled back migration");
        }

        Ok(group)
    }

    /// Registered and recorded migrations, in name order.
    pub async fn status(&self) -> Result<Vec<MigrationStatus>> {
        let mut applied: BTreeMap<String, AppliedMigration> = self
            .ledger
            .applied()
            .await?
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();

        let mut statuses: Vec<MigrationStatus> = self
            .migrations
            .iter()
            .map(|m| MigrationStatus {
                name: m.name.to_string(),
                comment: m.comment.to_string(),
                applied: applied.remove(m.name.as_ref()),
                registered: true,
            })
            .collect();

        statuses.extend(applied.into_values().map(|m| MigrationStatus {
            name: m.name.clone(),
            comment: String::new(),
            applied: Some(m),
            registered: false,
        }));
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests;
