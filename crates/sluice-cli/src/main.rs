use std::process::ExitCode;

use camino::Utf8Path;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use sluice::{Connection, Error, Inspector, MigrationGroup, Migrations, Migrator, State};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

mod config;

use config::{Config, ConfigError};

/// Schema migrations for Postgres.
#[derive(Debug, Parser)]
#[command(name = "sluice", version)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the ledger tables if they don't exist
    Init,
    /// Show applied and pending migrations
    Status,
    /// Run pending migrations
    Migrate,
    /// Roll back the last migration group
    Rollback,
    /// Take the migration lock
    Lock,
    /// Release the migration lock
    Unlock,
    /// Drop and recreate the ledger tables
    Reset {
        /// Confirm; forgets every applied migration
        #[arg(long)]
        yes: bool,
    },
    /// Print the live database schema
    Inspect,
    /// Create an empty up/down SQL migration pair
    Create {
        /// Migration name (e.g., "add_users_table")
        name: String,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sluice(#[from] Error),

    #[error(transparent)]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("refusing to reset the ledger without --yes")]
    ResetNotConfirmed,

    #[error("invalid migration name {0:?}: use letters, digits and underscores")]
    InvalidName(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", "error:".red().bold(), err);
            if let CliError::Sluice(Error::Migration { group, .. }) = &err {
                eprintln!(
                    "{} {} stays recorded; run `sluice rollback` to undo it",
                    "note:".yellow().bold(),
                    group
                );
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = cli.config;

    if let Commands::Create { name } = &cli.command {
        return create(&config.migrations_dir, name);
    }
    if let Commands::Reset { yes: false } = cli.command {
        return Err(CliError::ResetNotConfirmed);
    }

    let pool = config.pool()?;
    let client = pool.get().await?;
    let conn: &dyn Connection = &client;

    match cli.command {
        Commands::Init => {
            migrator(conn, &config, Migrations::new()).init().await?;
            println!("{} ledger tables ready", "✓".green());
        }
        Commands::Status => {
            let migrator = migrator(conn, &config, discover(&config.migrations_dir)?);
            migrator.init().await?;
            status(&migrator).await?;
        }
        Commands::Migrate => {
            let migrator = migrator(conn, &config, discover(&config.migrations_dir)?);
            let group = migrator.run().await?;
            print_group("applied", &group);
        }
        Commands::Rollback => {
            let migrator = migrator(conn, &config, discover(&config.migrations_dir)?);
            migrator.init().await?;
            let group = migrator.run_locked(migrator.rollback()).await?;
            print_group("rolled back", &group);
        }
        Commands::Lock => {
            let migrator = migrator(conn, &config, Migrations::new());
            migrator.init().await?;
            migrator.lock().await?;
            println!("{} migration lock taken", "✓".green());
        }
        Commands::Unlock => {
            migrator(conn, &config, Migrations::new()).unlock().await?;
            println!("{} migration lock released", "✓".green());
        }
        Commands::Reset { .. } => {
            migrator(conn, &config, Migrations::new()).reset().await?;
            println!("{} ledger tables recreated", "✓".green());
        }
        Commands::Inspect => {
            let state = Inspector::new(conn)
                .exclude_tables(config.ledger().table_names())
                .inspect()
                .await?;
            print_schema(&state);
        }
        // handled before connecting
        Commands::Create { .. } => {}
    }
    Ok(())
}

fn migrator<'a>(conn: &'a dyn Connection, config: &Config, migrations: Migrations) -> Migrator<'a> {
    Migrator::new(conn, migrations, config.ledger())
}

/// Load SQL migrations, treating a missing directory as empty.
fn discover(dir: &Utf8Path) -> Result<Migrations, CliError> {
    if !dir.exists() {
        tracing::warn!(%dir, "migrations directory not found");
        return Ok(Migrations::registered());
    }
    let mut migrations = Migrations::registered();
    migrations.extend(Migrations::discover(dir)?);
    tracing::debug!(count = migrations.len(), %dir, "loaded migrations");
    Ok(migrations)
}

async fn status(migrator: &Migrator<'_>) -> Result<(), CliError> {
    let status = migrator.status().await?;
    if status.is_empty() {
        println!("No migrations.");
        return Ok(());
    }

    for entry in &status {
        let comment = if entry.comment.is_empty() {
            String::new()
        } else {
            format!(" ({})", entry.comment)
        };
        match &entry.applied {
            Some(applied) => {
                let note = if entry.registered {
                    String::new()
                } else {
                    format!(" {}", "[missing]".red())
                };
                println!(
                    "  {} {}{} {}{}",
                    "applied".green(),
                    entry.name.bold(),
                    comment.dimmed(),
                    format!(
                        "group #{} at {}",
                        applied.group_id,
                        applied.migrated_at.format("%Y-%m-%d %H:%M:%S")
                    )
                    .dimmed(),
                    note
                );
            }
            None => println!(
                "  {} {}{}",
                "pending".yellow(),
                entry.name.bold(),
                comment.dimmed()
            ),
        }
    }

    let pending = status.iter().filter(|s| !s.is_applied()).count();
    println!();
    println!("{} applied, {} pending", status.len() - pending, pending);
    Ok(())
}

fn print_group(verb: &str, group: &MigrationGroup) {
    if group.is_empty() {
        println!("Nothing to do.");
        return;
    }
    println!("{} {} {}", "✓".green(), verb, group);
    for name in &group.migrations {
        println!("    {name}");
    }
}

fn print_schema(state: &State) {
    if state.tables.is_empty() {
        println!("No tables.");
        return;
    }

    println!("Schema ({} tables):", state.tables.len());
    println!();
    for (id, table) in &state.tables {
        println!("  {} ({} columns)", id.bold(), table.columns.len());
        for (name, col) in &table.columns {
            let mut attrs = Vec::new();
            if col.is_pk {
                attrs.push("PK".to_string());
            }
            if col.is_unique {
                attrs.push("UNIQUE".to_string());
            }
            if !col.is_nullable {
                attrs.push("NOT NULL".to_string());
            }
            if col.is_auto_increment {
                attrs.push("SERIAL".to_string());
            }
            if col.is_identity {
                attrs.push("IDENTITY".to_string());
            }
            if !col.default_value.is_empty() {
                attrs.push(format!("DEFAULT {}", col.default_value));
            }

            let attrs = if attrs.is_empty() {
                String::new()
            } else {
                format!(" [{}]", attrs.join(", "))
            };
            println!("    {}: {}{}", name, col.sql_type.cyan(), attrs.dimmed());
        }

        for (fk, constraint) in &state.foreign_keys {
            if fk.from.table_id() == *id {
                println!("    FK {}: {}", constraint.dimmed(), fk);
            }
        }
        println!();
    }
}

/// Write `<timestamp>_<name>.up.sql` and `.down.sql` into `dir`.
fn create(dir: &Utf8Path, name: &str) -> Result<(), CliError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CliError::InvalidName(name.to_string()));
    }

    let stem = format!("{}_{name}", chrono::Utc::now().format("%Y%m%d%H%M%S"));
    std::fs::create_dir_all(dir).map_err(Error::from)?;
    for direction in ["up", "down"] {
        let path = dir.join(format!("{stem}.{direction}.sql"));
        std::fs::write(&path, format!("-- {name} ({direction})\n")).map_err(Error::from)?;
        println!("{} created {}", "✓".green(), path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_reset_needs_flag() {
        let cli = Cli::try_parse_from(["sluice", "reset"]).unwrap();
        assert!(matches!(cli.command, Commands::Reset { yes: false }));
        let cli = Cli::try_parse_from(["sluice", "reset", "--yes"]).unwrap();
        assert!(matches!(cli.command, Commands::Reset { yes: true }));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "sluice",
            "status",
            "--migrations-dir",
            "db/migrations",
            "--database-url",
            "postgres://localhost/app",
        ])
        .unwrap();
        assert_eq!(cli.config.migrations_dir, "db/migrations");
        assert_eq!(
            cli.config.database_url.as_deref(),
            Some("postgres://localhost/app")
        );
    }

    #[test]
    fn test_create_writes_discoverable_pair() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join("migrations");

        create(&root, "add_users").unwrap();

        let migrations = Migrations::discover(&root).unwrap();
        assert_eq!(migrations.len(), 1);
        let migration = migrations.iter().next().unwrap();
        assert!(migration.name.ends_with("_add_users"));
        assert_eq!(migration.comment, "add_users");
    }

    #[test]
    fn test_create_rejects_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        assert!(matches!(
            create(root, "drop table;"),
            Err(CliError::InvalidName(_))
        ));
        assert!(matches!(create(root, ""), Err(CliError::InvalidName(_))));
    }
}
