//! The migration ledger: which migrations ran, in which group, and the lock.
//!
//! Two tables back the Postgres ledger:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS "sluice_migrations" (
//!     id BIGSERIAL PRIMARY KEY,
//!     name VARCHAR NOT NULL UNIQUE,
//!     group_id BIGINT NOT NULL,
//!     migrated_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//!
//! CREATE TABLE IF NOT EXISTS "sluice_migration_locks" (
//!     id BIGSERIAL PRIMARY KEY,
//!     table_name VARCHAR NOT NULL UNIQUE
//! );
//! ```
//!
//! Locking inserts a row keyed by the migrations table name into the locks
//! table. The unique constraint makes a second insert fail, which is how a
//! concurrent migrator finds out it lost the race.
//!
//! Creating the tables happens before any lock row can exist, so `init`
//! takes a transaction-scoped advisory lock keyed by the same name. Two
//! processes initializing a fresh database queue up instead of racing on
//! the catalog.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use sluice_schema::{Lit, quote_path};
use tokio_postgres::error::SqlState;

use crate::traced::{Connection, ConnectionExt};
use crate::{Error, Result};

/// Names of the ledger tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Table recording applied migrations. May be schema-qualified (`ops.migrations`).
    pub migrations_table: String,
    /// Table holding the lock row.
    pub locks_table: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            migrations_table: "sluice_migrations".to_string(),
            locks_table: "sluice_migration_locks".to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn with_migrations_table(mut self, table: impl Into<String>) -> Self {
        self.migrations_table = table.into();
        self
    }

    pub fn with_locks_table(mut self, table: impl Into<String>) -> Self {
        self.locks_table = table.into();
        self
    }

    /// Unqualified names of both tables, for excluding them from inspection.
    pub fn table_names(&self) -> Vec<String> {
        [&self.migrations_table, &self.locks_table]
            .into_iter()
            .map(|t| t.rsplit('.').next().unwrap_or(t.as_str()).to_string())
            .collect()
    }
}

/// A migration recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub id: i64,
    pub name: String,
    pub group_id: i64,
    pub migrated_at: DateTime<Utc>,
}

/// Migrations applied (or rolled back) together by one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationGroup {
    /// Group id, 0 when nothing ran
    pub id: i64,
    /// Migration names in application order
    pub migrations: Vec<String>,
}

impl MigrationGroup {
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }
}

impl std::fmt::Display for MigrationGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "empty group");
        }
        write!(f, "group #{} ({})", self.id, self.migrations.join(", "))
    }
}

/// Persistent record of applied migrations plus the migration lock.
pub trait Ledger: Send + Sync {
    fn migrations_table(&self) -> &str;

    /// Create the ledger tables if they don't exist.
    fn init(&self) -> impl Future<Output = Result<()>> + Send;

    /// Drop and recreate the ledger tables, forgetting every applied migration.
    fn reset(&self) -> impl Future<Output = Result<()>> + Send;

    /// Take the migration lock, failing with [`Error::Locked`] if it is held.
    fn lock(&self) -> impl Future<Output = Result<()>> + Send;

    /// Release the migration lock. Releasing a lock that isn't held is a no-op.
    fn unlock(&self) -> impl Future<Output = Result<()>> + Send;

    /// Every applied migration, oldest first.
    fn applied(&self) -> impl Future<Output = Result<Vec<AppliedMigration>>> + Send;

    fn mark_applied(&self, name: &str, group_id: i64) -> impl Future<Output = Result<()>> + Send;

    fn mark_unapplied(&self, name: &str) -> impl Future<Output = Result<()>> + Send;
}

impl<L: Ledger> Ledger for &L {
    fn migrations_table(&self) -> &str {
        (**self).migrations_table()
    }

    fn init(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).init()
    }

    fn reset(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).reset()
    }

    fn lock(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).lock()
    }

    fn unlock(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).unlock()
    }

    fn applied(&self) -> impl Future<Output = Result<Vec<AppliedMigration>>> + Send {
        (**self).applied()
    }

    fn mark_applied(&self, name: &str, group_id: i64) -> impl Future<Output = Result<()>> + Send {
        (**self).mark_applied(name, group_id)
    }

    fn mark_unapplied(&self, name: &str) -> impl Future<Output = Result<()>> + Send {
        (**self).mark_unapplied(name)
    }
}

/// Run `body` while holding the ledger's lock.
///
/// The lock is released on every exit path: success, error and panic. A
/// panic is re-raised after unlocking. When both `body` and the unlock fail,
/// the body's error wins and the unlock failure is logged. When only the
/// unlock fails, the body's value is still returned: its work is committed
/// and the caller needs to see it.
pub async fn with_lock<L, F, T>(ledger: &L, body: F) -> Result<T>
where
    L: Ledger,
    F: Future<Output = Result<T>>,
{
    ledger.lock().await?;
    tracing::debug!(table = ledger.migrations_table(), "migration lock acquired");

    let outcome = AssertUnwindSafe(body).catch_unwind().await;
    let unlocked = ledger.unlock().await;

    match outcome {
        Ok(Ok(value)) => {
            match unlocked {
                Ok(()) => {
                    tracing::debug!(table = ledger.migrations_table(), "migration lock released")
                }
                Err(e) => tracing::error!(
                    table = ledger.migrations_table(),
                    error = %e,
                    "failed to release migration lock; it may still be held"
                ),
            }
            Ok(value)
        }
        Ok(Err(err)) => {
            if let Err(unlock_err) = unlocked {
                tracing::error!(error = %unlock_err, "failed to release migration lock");
            }
            Err(err)
        }
        Err(panic) => {
            if let Err(unlock_err) = unlocked {
                tracing::error!(error = %unlock_err, "failed to release migration lock");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

/// Postgres-backed ledger.
pub struct PgLedger<'a> {
    conn: &'a dyn Connection,
    config: LedgerConfig,
}

impl<'a> PgLedger<'a> {
    pub fn new(conn: &'a dyn Connection, config: LedgerConfig) -> Self {
        Self { conn, config }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn migrations(&self) -> String {
        quote_path(&self.config.migrations_table)
    }

    fn locks(&self) -> String {
        quote_path(&self.config.locks_table)
    }
}

impl Ledger for PgLedger<'_> {
    fn migrations_table(&self) -> &str {
        &self.config.migrations_table
    }

    async fn init(&self) -> Result<()> {
        // one simple-query batch is one implicit transaction, so the
        // advisory lock covers both CREATE statements
        let sql = format!(
            "SELECT pg_advisory_xact_lock(hashtext({}));
CREATE TABLE IF NOT EXISTS {} (
    id BIGSERIAL PRIMARY KEY,
    name VARCHAR NOT NULL UNIQUE,
    group_id BIGINT NOT NULL,
    migrated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS {} (
    id BIGSERIAL PRIMARY KEY,
    table_name VARCHAR NOT NULL UNIQUE
);",
            Lit(&self.config.migrations_table),
            self.migrations(),
            self.locks()
        );
        self.conn.traced().batch_execute(&sql).await?;
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let sql = format!(
            "DROP TABLE IF EXISTS {};\nDROP TABLE IF EXISTS {};",
            self.migrations(),
            self.locks()
        );
        self.conn.traced().batch_execute(&sql).await?;
        tracing::info!(table = %self.config.migrations_table, "ledger reset");
        self.init().await
    }

    async fn lock(&self) -> Result<()> {
        let sql = format!("INSERT INTO {} (table_name) VALUES ($1)", self.locks());
        let table = &self.config.migrations_table;
        match self.conn.traced().execute(&sql, &[table]).await {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => Err(Error::Locked {
                table: table.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE table_name = $1", self.locks());
        self.conn
            .traced()
            .execute(&sql, &[&self.config.migrations_table])
            .await?;
        Ok(())
    }

    async fn applied(&self) -> Result<Vec<AppliedMigration>> {
        let sql = format!(
            "SELECT id, name, group_id, migrated_at FROM {} ORDER BY id",
            self.migrations()
        );
        let rows = self.conn.traced().query(&sql, &[]).await?;
        rows.iter()
            .map(|row| -> Result<AppliedMigration> {
                Ok(AppliedMigration {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    group_id: row.try_get("group_id")?,
                    migrated_at: row.try_get("migrated_at")?,
                })
            })
            .collect()
    }

    async fn mark_applied(&self, name: &str, group_id: i64) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (name, group_id) VALUES ($1, $2)",
            self.migrations()
        );
        self.conn
            .traced()
            .execute(&sql, &[&name, &group_id])
            .await?;
        Ok(())
    }

    async fn mark_unapplied(&self, name: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE name = $1", self.migrations());
        self.conn.traced().execute(&sql, &[&name]).await?;
        Ok(())
    }
}

/// In-memory ledger for unit tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryLedger {
    inner: std::sync::Mutex<MemoryInner>,
}

#[cfg(test)]
#[derive(Default)]
struct MemoryInner {
    rows: Vec<AppliedMigration>,
    locked: bool,
    next_id: i64,
    lock_calls: usize,
    unlock_calls: usize,
    unlock_fails: bool,
}

#[cfg(test)]
impl MemoryLedger {
    pub(crate) fn names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.rows.iter().map(|r| r.name.clone()).collect()
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.inner.lock().unwrap().locked
    }

    /// Make every later `unlock` fail and leave the lock held.
    pub(crate) fn fail_unlocks(&self) {
        self.inner.lock().unwrap().unlock_fails = true;
    }

    pub(crate) fn lock_calls(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.lock_calls, inner.unlock_calls)
    }
}

#[cfg(test)]
impl Ledger for MemoryLedger {
    fn migrations_table(&self) -> &str {
        "sluice_migrations"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.rows.clear();
        inner.locked = false;
        Ok(())
    }

    async fn lock(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.lock_calls += 1;
        if inner.locked {
            return Err(Error::Locked {
                table: "sluice_migrations".into(),
            });
        }
        inner.locked = true;
        Ok(())
    }

    async fn unlock(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.unlock_calls += 1;
        if inner.unlock_fails {
            return Err(Error::Io(std::io::Error::other("connection reset")));
        }
        inner.locked = false;
        Ok(())
    }

    async fn applied(&self) -> Result<Vec<AppliedMigration>> {
        Ok(self.inner.lock().unwrap().rows.clone())
    }

    async fn mark_applied(&self, name: &str, group_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.rows.push(AppliedMigration {
            id,
            name: name.to_string(),
            group_id,
            migrated_at: Utc::now(),
        });
        Ok(())
    }

    async fn mark_unapplied(&self, name: &str) -> Result<()> {
        self.inner.lock().unwrap().rows.retain(|r| r.name != name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traced::RecordingConn;

    #[test]
    fn test_default_table_names() {
        let config = LedgerConfig::default();
        assert_eq!(
            config.table_names(),
            vec!["sluice_migrations", "sluice_migration_locks"]
        );
    }

    #[test]
    fn test_qualified_table_names_are_unqualified_for_exclusion() {
        let config = LedgerConfig::default()
            .with_migrations_table("ops.migrations")
            .with_locks_table("ops.migration_locks");
        assert_eq!(config.table_names(), vec!["migrations", "migration_locks"]);
    }

    #[test]
    fn test_group_display() {
        let group = MigrationGroup {
            id: 3,
            migrations: vec!["m1".into(), "m2".into()],
        };
        assert_eq!(group.to_string(), "group #3 (m1, m2)");
        assert_eq!(MigrationGroup::default().to_string(), "empty group");
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let ledger = MemoryLedger::default();
        let result: Result<()> = with_lock(&ledger, async {
            Err(Error::UnknownMigration { name: "m1".into() })
        })
        .await;
        assert!(matches!(result, Err(Error::UnknownMigration { .. })));
        assert!(!ledger.is_locked());
        assert_eq!(ledger.lock_calls(), (1, 1));
    }

    #[tokio::test]
    async fn test_with_lock_fails_when_held() {
        let ledger = MemoryLedger::default();
        ledger.lock().await.unwrap();

        let result = with_lock(&ledger, async { Ok(42) }).await;
        assert!(result.unwrap_err().is_locked());
        // the holder keeps its lock
        assert!(ledger.is_locked());
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_panic() {
        let ledger = MemoryLedger::default();
        let outcome = AssertUnwindSafe(with_lock(&ledger, async {
            if ledger.is_locked() {
                panic!("boom");
            }
            Ok(())
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert!(!ledger.is_locked());
    }

    #[tokio::test]
    async fn test_with_lock_keeps_value_when_unlock_fails() {
        let ledger = MemoryLedger::default();
        ledger.fail_unlocks();

        let group = with_lock(&ledger, async {
            Ok(MigrationGroup {
                id: 1,
                migrations: vec!["m1".into()],
            })
        })
        .await
        .unwrap();
        assert_eq!(group.migrations, vec!["m1"]);
        assert_eq!(ledger.lock_calls(), (1, 1));
        assert!(ledger.is_locked());
    }

    #[tokio::test]
    async fn test_with_lock_body_error_wins_over_unlock_error() {
        let ledger = MemoryLedger::default();
        ledger.fail_unlocks();

        let result: Result<()> = with_lock(&ledger, async {
            Err(Error::UnknownMigration { name: "m1".into() })
        })
        .await;
        assert!(matches!(result, Err(Error::UnknownMigration { .. })));
    }

    #[tokio::test]
    async fn test_init_serializes_table_creation() {
        let conn = RecordingConn::default();
        let ledger = PgLedger::new(
            &conn,
            LedgerConfig::default().with_migrations_table("ops.it's"),
        );
        ledger.init().await.unwrap();

        let log = conn.log();
        assert_eq!(log.len(), 1);
        let batch = &log[0];
        assert!(
            batch.starts_with("SELECT pg_advisory_xact_lock(hashtext('ops.it''s'));"),
            "{batch}"
        );
        assert!(batch.contains("CREATE TABLE IF NOT EXISTS \"ops\".\"it's\""));
        assert!(batch.contains("CREATE TABLE IF NOT EXISTS \"sluice_migration_locks\""));
    }

    #[tokio::test]
    async fn test_with_lock_returns_value() {
        let ledger = MemoryLedger::default();
        let value = with_lock(&ledger, async { Ok("done") }).await.unwrap();
        assert_eq!(value, "done");
        assert!(!ledger.is_locked());
    }
}
