//! Diff-driven migrations.
//!
//! The [`AutoMigrator`] compares the live database with a desired [`State`]
//! and applies the difference as a synthetic migration named after the
//! current UTC time. The same plan can be written out as a pair of SQL files
//! instead, for review or to check into version control.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use sluice_schema::State;

use crate::dialect::{Dialect, PgDialect};
use crate::diff::Detector;
use crate::inspect::Inspector;
use crate::ledger::{Ledger, LedgerConfig, MigrationGroup, PgLedger, with_lock};
use crate::migrate::{Migration, Migrations, Migrator};
use crate::operation::Changeset;
use crate::traced::Connection;
use crate::{Error, Result};

/// Settings for an [`AutoMigrator`].
#[derive(Debug, Clone)]
pub struct AutoMigratorConfig {
    pub ledger: LedgerConfig,
    /// Tables the inspector ignores, on top of the ledger tables.
    pub exclude_tables: Vec<String>,
    /// Where [`AutoMigrator::create_sql_migrations`] writes files.
    pub migrations_dir: Utf8PathBuf,
}

impl Default for AutoMigratorConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            exclude_tables: Vec::new(),
            migrations_dir: Utf8PathBuf::from("migrations"),
        }
    }
}

/// The changes needed to bring a database to its desired state.
#[derive(Debug, Clone)]
pub struct Plan {
    /// The inspected state
    pub current: State,
    /// current → desired
    pub up: Changeset,
    /// desired → current
    pub down: Changeset,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.up.is_empty()
    }
}

/// Paths written by [`AutoMigrator::create_sql_migrations`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlMigrationFiles {
    pub name: String,
    pub up: Utf8PathBuf,
    pub down: Utf8PathBuf,
}

/// Brings a database to a desired [`State`].
pub struct AutoMigrator<'a> {
    conn: &'a dyn Connection,
    target: State,
    config: AutoMigratorConfig,
    dialect: PgDialect,
    /// Synthetic migrations applied by this instance, kept for rollback.
    generated: Migrations,
}

impl<'a> AutoMigrator<'a> {
    pub fn new(conn: &'a dyn Connection, target: State, config: AutoMigratorConfig) -> Self {
        Self {
            conn,
            target,
            config,
            dialect: PgDialect,
            generated: Migrations::new(),
        }
    }

    pub fn target(&self) -> &State {
        &self.target
    }

    fn ledger(&self) -> PgLedger<'a> {
        PgLedger::new(self.conn, self.config.ledger.clone())
    }

    /// An inspector that skips the ledger tables and configured exclusions.
    pub fn inspector(&self) -> Inspector<'a> {
        Inspector::new(self.conn)
            .exclude_tables(self.config.ledger.table_names())
            .exclude_tables(self.config.exclude_tables.iter().cloned())
    }

    /// Inspect the database and diff it against the target, both ways.
    pub async fn plan(&self) -> Result<Plan> {
        let current = self.inspector().inspect().await?;
        let detector = Detector::new();
        let up = detector.diff(&current, &self.target);
        let down = detector.diff(&self.target, &current);
        for diag in &up.diagnostics {
            tracing::warn!(%diag, "auto-migration will not apply this change");
        }
        Ok(Plan { current, up, down })
    }

    /// Apply the difference between the database and the target.
    ///
    /// Runs under the migration lock: inspect, diff, simulate, then apply
    /// the result as one migration in a new group. Returns `None` when the
    /// database already matches.
    pub async fn run(&mut self) -> Result<Option<MigrationGroup>> {
        let ledger = self.ledger();
        ledger.init().await?;

        let this = &*self;
        let outcome = with_lock(&ledger, async {
            let plan = this.plan().await?;
            if plan.is_empty() {
                tracing::info!("database schema matches the target");
                return Ok(None);
            }

            plan.up.simulate(&plan.current)?;

            let name = migration_name();
            tracing::info!(migration = %name, operations = plan.up.len(), "auto-migrating");
            let migration = Migration::operations(&name, plan.up, plan.down).with_comment("auto");
            let migrator = Migrator::with_ledger(
                this.conn,
                &ledger,
                Migrations::new().with(migration.clone()),
            );
            let applied = migrator.migrate().await;
            Ok::<_, Error>(Some((migration, applied)))
        })
        .await?;

        let Some((migration, applied)) = outcome else {
            return Ok(None);
        };
        self.generated.add(migration);
        applied.map(Some)
    }

    /// Roll back the last group, which must consist of migrations applied by
    /// this instance.
    pub async fn rollback(&self) -> Result<MigrationGroup> {
        let ledger = self.ledger();
        let migrator = Migrator::with_ledger(self.conn, &ledger, self.generated.clone());
        migrator.run_locked(migrator.rollback()).await
    }

    /// Write the current plan as `<timestamp>_auto.up.sql` and
    /// `<timestamp>_auto.down.sql` instead of applying it.
    ///
    /// Returns `None` (and writes nothing) when there is nothing to do.
    pub async fn create_sql_migrations(&self) -> Result<Option<SqlMigrationFiles>> {
        let plan = self.plan().await?;
        if plan.is_empty() {
            return Ok(None);
        }
        plan.up.simulate(&plan.current)?;

        let name = format!("{}_auto", migration_name());
        let files = write_sql_migration(
            &self.config.migrations_dir,
            &name,
            &plan.up.to_sql(&self.dialect),
            &plan.down.to_sql(&self.dialect),
        )?;
        tracing::info!(up = %files.up, down = %files.down, "wrote sql migrations");
        Ok(Some(files))
    }

    pub fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }
}

/// Migration names are UTC timestamps with millisecond precision, so they
/// sort in creation order and two runs in the same second don't collide.
pub(crate) fn migration_name() -> String {
    Utc::now().format("%Y%m%d%H%M%S%3f").to_string()
}

/// Write an up/down pair into `dir`, creating it if needed.
pub(crate) fn write_sql_migration(
    dir: &Utf8Path,
    name: &str,
    up: &str,
    down: &str,
) -> Result<SqlMigrationFiles> {
    std::fs::create_dir_all(dir)?;
    let files = SqlMigrationFiles {
        name: name.to_string(),
        up: dir.join(format!("{name}.up.sql")),
        down: dir.join(format!("{name}.down.sql")),
    };
    std::fs::write(&files.up, up)?;
    std::fs::write(&files.down, down)?;
    Ok(files)
}
