use super::*;
use crate::BoxFuture;
use crate::ledger::MemoryLedger;
use crate::operation::Operation;
use crate::traced::RecordingConn;
use sluice_schema::{Column, Table};

fn failing_up<'a>(ctx: &'a MigrationContext<'a>) -> BoxFuture<'a, MigrationResult<()>> {
    Box::pin(async move {
        ctx.execute("up 2").await?;
        Err(MigrationError::new("column already exists"))
    })
}

fn logging_down<'a>(ctx: &'a MigrationContext<'a>) -> BoxFuture<'a, MigrationResult<()>> {
    Box::pin(async move {
        ctx.execute(&format!("down {}", ctx.name())).await?;
        Ok(())
    })
}

fn sql(name: &str, n: u32) -> Migration {
    Migration::sql(name, format!("up {n}"), format!("down {n}"))
}

fn migrator<'a>(conn: &'a RecordingConn, migrations: Migrations) -> Migrator<'a, MemoryLedger> {
    Migrator::with_ledger(conn, MemoryLedger::default(), migrations)
}

#[tokio::test]
async fn test_migrate_applies_in_name_order() {
    let conn = RecordingConn::default();
    let migrations = Migrations::new()
        .with(sql("20260102_second", 2))
        .with(sql("20260101_first", 1));
    let migrator = migrator(&conn, migrations);

    let group = migrator.migrate().await.unwrap();
    assert_eq!(group.id, 1);
    assert_eq!(group.migrations, vec!["20260101_first", "20260102_second"]);
    assert_eq!(
        conn.log(),
        vec!["BEGIN", "up 1", "COMMIT", "BEGIN", "up 2", "COMMIT"]
    );
    assert_eq!(
        migrator.ledger().names(),
        vec!["20260101_first", "20260102_second"]
    );
}

#[tokio::test]
async fn test_migrate_twice_is_noop_then_new_group() {
    let conn = RecordingConn::default();
    let mut migrator = migrator(&conn, Migrations::new().with(sql("m1", 1)));

    assert_eq!(migrator.migrate().await.unwrap().id, 1);
    let again = migrator.migrate().await.unwrap();
    assert!(again.is_empty());
    assert_eq!(again.id, 0);

    migrator.migrations_mut().add(sql("m2", 2));
    let group = migrator.migrate().await.unwrap();
    assert_eq!(group.id, 2);
    assert_eq!(group.migrations, vec!["m2"]);
}

#[tokio::test]
async fn test_partial_failure_then_rollback() {
    let conn = RecordingConn::default();
    let migrations = Migrations::new()
        .with(sql("m1", 1))
        .with(Migration {
            name: "m2".into(),
            comment: "".into(),
            up: Step::Func(failing_up),
            down: Step::Func(logging_down),
            transactional: true,
        })
        .with(sql("m3", 3));
    let migrator = migrator(&conn, migrations);

    let err = migrator.migrate().await.unwrap_err();
    let Error::Migration {
        name,
        group,
        source,
    } = err
    else {
        panic!("expected a migration error");
    };
    assert_eq!(name, "m2");
    assert_eq!(group.migrations, vec!["m1", "m2"]);
    assert_eq!(source.message(), "column already exists");
    assert!(source.location().file().ends_with("tests.rs"));

    // m3 never ran, the failed migration is still recorded
    assert_eq!(migrator.ledger().names(), vec!["m1", "m2"]);
    assert_eq!(
        conn.log(),
        vec!["BEGIN", "up 1", "COMMIT", "BEGIN", "up 2", "ROLLBACK"]
    );

    let rolled_back = migrator.rollback().await.unwrap();
    assert_eq!(rolled_back.migrations, vec!["m1", "m2"]);
    assert_eq!(
        conn.log()[6..],
        ["BEGIN", "down m2", "COMMIT", "BEGIN", "down 1", "COMMIT"]
    );
    assert!(migrator.ledger().names().is_empty());
}

#[tokio::test]
async fn test_rollback_only_last_group() {
    let conn = RecordingConn::default();
    let mut migrator = migrator(&conn, Migrations::new().with(sql("m1", 1)));
    migrator.migrate().await.unwrap();
    migrator.migrations_mut().add(sql("m2", 2));
    migrator.migrate().await.unwrap();

    let group = migrator.rollback().await.unwrap();
    assert_eq!(group.id, 2);
    assert_eq!(migrator.ledger().names(), vec!["m1"]);
}

#[tokio::test]
async fn test_rollback_with_nothing_applied() {
    let conn = RecordingConn::default();
    let migrator = migrator(&conn, Migrations::new().with(sql("m1", 1)));
    let group = migrator.rollback().await.unwrap();
    assert!(group.is_empty());
    assert!(conn.log().is_empty());
}

#[tokio::test]
async fn test_rollback_unknown_migration() {
    let conn = RecordingConn::default();
    let ledger = MemoryLedger::default();
    ledger.mark_applied("m1", 1).await.unwrap();
    ledger.mark_applied("gone", 1).await.unwrap();
    let migrator = Migrator::with_ledger(&conn, ledger, Migrations::new().with(sql("m1", 1)));

    let err = migrator.rollback().await.unwrap_err();
    assert!(matches!(err, Error::UnknownMigration { ref name } if name == "gone"));
    // nothing was rolled back
    assert!(conn.log().is_empty());
    assert_eq!(migrator.ledger().names(), vec!["m1", "gone"]);
}

#[tokio::test]
async fn test_run_holds_lock_and_releases_it() {
    let conn = RecordingConn::default();
    let migrator = migrator(&conn, Migrations::new().with(sql("m1", 1)));

    let group = migrator.run().await.unwrap();
    assert_eq!(group.migrations, vec!["m1"]);
    assert_eq!(migrator.ledger().lock_calls(), (1, 1));
    assert!(!migrator.ledger().is_locked());
}

#[tokio::test]
async fn test_run_fails_when_locked() {
    let conn = RecordingConn::default();
    let migrator = migrator(&conn, Migrations::new().with(sql("m1", 1)));
    migrator.lock().await.unwrap();

    let err = migrator.run().await.unwrap_err();
    assert!(err.is_locked());
    assert!(conn.log().is_empty());

    migrator.unlock().await.unwrap();
    assert_eq!(migrator.run().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_releases_lock_after_failure() {
    let conn = RecordingConn::default();
    let migrations = Migrations::new().with(Migration {
        name: "broken".into(),
        comment: "".into(),
        up: Step::Func(failing_up),
        down: Step::Noop,
        transactional: false,
    });
    let migrator = migrator(&conn, migrations);

    assert!(matches!(
        migrator.run().await,
        Err(Error::Migration { .. })
    ));
    assert!(!migrator.ledger().is_locked());
    // no transaction to roll back
    assert_eq!(conn.log(), vec!["up 2"]);
}

#[tokio::test]
async fn test_without_transaction_runs_bare() {
    let conn = RecordingConn::default();
    let migrations = Migrations::new().with(
        Migration::sql(
            "m1",
            "CREATE INDEX CONCURRENTLY idx ON t (c)",
            "DROP INDEX CONCURRENTLY idx",
        )
        .without_transaction(),
    );
    let migrator = migrator(&conn, migrations);

    migrator.migrate().await.unwrap();
    migrator.rollback().await.unwrap();
    assert_eq!(
        conn.log(),
        vec![
            "CREATE INDEX CONCURRENTLY idx ON t (c)",
            "DROP INDEX CONCURRENTLY idx",
        ]
    );
}

#[tokio::test]
async fn test_noop_step_opens_no_transaction() {
    let conn = RecordingConn::default();
    let migrator = migrator(&conn, Migrations::new().with(Migration::sql("m1", "", "")));

    assert_eq!(migrator.migrate().await.unwrap().migrations, vec!["m1"]);
    assert!(conn.log().is_empty());
}

fn panicking_up<'a>(ctx: &'a MigrationContext<'a>) -> BoxFuture<'a, MigrationResult<()>> {
    Box::pin(async move {
        ctx.execute("up 1").await?;
        if ctx.name() == "m1" {
            panic!("boom");
        }
        Ok(())
    })
}

#[tokio::test]
async fn test_panicking_step_rolls_back_transaction() {
    let conn = RecordingConn::default();
    let migrator = migrator(
        &conn,
        Migrations::new().with(Migration::new("m1", panicking_up, logging_down)),
    );

    let panicked = AssertUnwindSafe(migrator.run()).catch_unwind().await;
    assert!(panicked.is_err());
    assert_eq!(conn.log(), vec!["BEGIN", "up 1", "ROLLBACK"]);
    assert!(!migrator.ledger().is_locked());
}

#[tokio::test]
async fn test_operations_step_renders_with_dialect() {
    let conn = RecordingConn::default();
    let up = Changeset::new().with(Operation::CreateTable {
        table: Table::new("public", "tag").column("name", Column::new("text").primary_key()),
    });
    let down = Changeset::new().with(Operation::DropTable {
        schema: "public".into(),
        name: "tag".into(),
    });
    let migrator = migrator(
        &conn,
        Migrations::new().with(Migration::operations("m1", up, down)),
    );

    migrator.migrate().await.unwrap();
    migrator.rollback().await.unwrap();
    assert_eq!(
        conn.log(),
        vec![
            "CREATE TABLE \"public\".\"tag\" (\n    \"name\" text PRIMARY KEY\n);",
            "DROP TABLE \"public\".\"tag\";",
        ]
    );
}

#[tokio::test]
async fn test_status_lists_registered_and_recorded() {
    let conn = RecordingConn::default();
    let ledger = MemoryLedger::default();
    ledger.mark_applied("m0_orphan", 1).await.unwrap();
    ledger.mark_applied("m1", 1).await.unwrap();
    let migrations = Migrations::new()
        .with(sql("m1", 1))
        .with(sql("m2", 2).with_comment("add index"));
    let migrator = Migrator::with_ledger(&conn, ledger, migrations);

    let status = migrator.status().await.unwrap();
    let summary: Vec<(&str, bool, bool)> = status
        .iter()
        .map(|s| (s.name.as_str(), s.is_applied(), s.registered))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("m0_orphan", true, false),
            ("m1", true, true),
            ("m2", false, true),
        ]
    );
    assert_eq!(status[2].comment, "add index");
}

#[test]
fn test_blank_sql_is_noop() {
    let migration = Migration::sql("m1", "CREATE TABLE x ()", "  \n");
    assert!(matches!(migration.up, Step::Sql(_)));
    assert!(matches!(migration.down, Step::Noop));
}

#[test]
fn test_discover_sql_files() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap();
    std::fs::write(root.join("20260101120000_create_user.up.sql"), "CREATE TABLE u ()").unwrap();
    std::fs::write(root.join("20260101120000_create_user.down.sql"), "DROP TABLE u").unwrap();
    std::fs::write(root.join("20260102120000_seed.up.sql"), "INSERT INTO u DEFAULT VALUES").unwrap();
    std::fs::write(root.join("README.md"), "not a migration").unwrap();

    let migrations = Migrations::discover(root).unwrap();
    let names: Vec<&str> = migrations.iter().map(|m| m.name.as_ref()).collect();
    assert_eq!(
        names,
        vec!["20260101120000_create_user", "20260102120000_seed"]
    );

    let first = migrations.get("20260101120000_create_user").unwrap();
    assert_eq!(first.comment, "create_user");
    assert!(matches!(&first.down, Step::Sql(sql) if *sql == "DROP TABLE u"));
    let second = migrations.get("20260102120000_seed").unwrap();
    assert!(matches!(second.down, Step::Noop));
    assert!(first.transactional && second.transactional);
}

#[test]
fn test_discover_notx_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap();
    std::fs::write(
        root.join("20260101_index.notx.up.sql"),
        "CREATE INDEX CONCURRENTLY i ON t (c)",
    )
    .unwrap();
    std::fs::write(
        root.join("20260101_index.notx.down.sql"),
        "DROP INDEX CONCURRENTLY i",
    )
    .unwrap();

    let migrations = Migrations::discover(root).unwrap();
    assert_eq!(migrations.len(), 1);
    let migration = migrations.get("20260101_index").unwrap();
    assert!(!migration.transactional);
    assert_eq!(migration.comment, "index");
    assert!(matches!(&migration.down, Step::Sql(sql) if *sql == "DROP INDEX CONCURRENTLY i"));
}

#[test]
fn test_discover_rejects_orphan_down() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap();
    std::fs::write(root.join("20260101_x.down.sql"), "DROP TABLE x").unwrap();

    let err = Migrations::discover(root).unwrap_err();
    assert!(matches!(err, Error::InvalidMigrationFile { .. }));
    assert!(err.to_string().contains("20260101_x.down.sql"));
}

#[test]
fn test_discover_missing_dir() {
    let err = Migrations::discover("/definitely/not/here").unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}
