//! clm-identity - Clerk → Firebase identity migration tool
//!
//! **Usage:**
//! ```bash
//! clm-identity phase1
//! clm-identity phase2 --mapping clerk_to_firebase.csv [--dry-run]
//! clm-identity phase3 [--null-duplicate-emails] [--snapshot-dir DIR]
//! clm-identity rollback
//! clm-identity status
//! ```

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use clm_common::config::{resolve_database_path, EmailConflictPolicy, TomlConfig, DB_PATH_ENV};
use clm_common::db::{create_snapshot, list_snapshots, open_maintenance_pool, restore_snapshot};
use clm_identity::mapping::{HttpLookup, IdentityMapper, StaticMapping};
use clm_identity::phase2::{migrate_identities, DataMigrationOptions};
use clm_identity::{default_chain, phase1, phase3, rollback, status};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "clm-identity", version)]
#[command(about = "Migrate user identities from Clerk to Firebase")]
struct Cli {
    /// Database file (overrides CLM_DB_PATH and the config file)
    #[arg(long, global = true, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// TOML config file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add nullable firebase_uid and profile columns
    Phase1,

    /// Backfill firebase_uid from clerk_user_id
    #[command(group(ArgGroup::new("source").required(true).args(["mapping", "provider_url"])))]
    Phase2 {
        /// Offline mapping file (.json object or clerk_user_id,firebase_uid CSV)
        #[arg(long, value_name = "FILE")]
        mapping: Option<PathBuf>,

        /// Identity provider lookup endpoint
        #[arg(long, value_name = "URL")]
        provider_url: Option<String>,

        /// Resolve everything, then roll back
        #[arg(long)]
        dry_run: bool,

        /// Rows read per batch
        #[arg(long)]
        batch_size: Option<i64>,
    },

    /// Validate identities, enforce constraints, drop clerk_user_id
    Phase3 {
        /// Keep duplicate emails on the lowest-id user and clear the rest
        #[arg(long)]
        null_duplicate_emails: bool,

        /// Take a snapshot here before mutating
        #[arg(long, value_name = "DIR")]
        snapshot_dir: Option<PathBuf>,
    },

    /// Remove Phase 3 constraints (clerk_user_id is not restored)
    Rollback,

    /// Per-state user counts
    Status,

    /// Write a snapshot of the database
    Snapshot {
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,

        #[arg(long, default_value = "manual")]
        label: String,
    },

    /// List snapshots
    Snapshots {
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Replace the database contents with a snapshot
    Restore {
        snapshot: PathBuf,
    },

    /// Apply pending schema migrations
    Migrate {
        #[arg(long, value_name = "ID")]
        target: Option<String>,
    },

    /// Revert schema migrations down to a target (or all)
    Downgrade {
        #[arg(long, value_name = "ID")]
        target: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!("clm-identity v{}", env!("CARGO_PKG_VERSION"));

    let config = TomlConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let db_path = resolve_database_path(cli.db_path.as_deref(), DB_PATH_ENV, &config);
    info!("Database path: {}", db_path.display());

    let pool = open_maintenance_pool(&db_path)
        .await
        .with_context(|| format!("Failed to open {}", db_path.display()))?;

    let result = run(cli.command, &pool, &config).await;
    pool.close().await;

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

async fn run(command: Command, pool: &SqlitePool, config: &TomlConfig) -> Result<()> {
    let settings = &config.migration;

    match command {
        Command::Phase1 => {
            let outcome = phase1::apply_identity_columns(pool).await?;
            println!(
                "Phase 1: {} column(s) added, indexes created: {:?}",
                outcome.columns_added, outcome.indexes_created
            );
        }

        Command::Phase2 {
            mapping,
            provider_url,
            dry_run,
            batch_size,
        } => {
            let mapper: Box<dyn IdentityMapper> = match (mapping, provider_url) {
                (Some(path), _) => Box::new(StaticMapping::from_path(&path)?),
                (None, Some(url)) => Box::new(HttpLookup::new(url)?),
                (None, None) => bail!("either --mapping or --provider-url is required"),
            };
            let options = DataMigrationOptions {
                batch_size: batch_size.unwrap_or(settings.batch_size),
                dry_run,
            };

            let report = migrate_identities(pool, mapper.as_ref(), options).await?;
            print!("{}", report.render());
            if !report.is_success() {
                bail!("{} user(s) could not be migrated", report.failures.len());
            }
        }

        Command::Phase3 {
            null_duplicate_emails,
            snapshot_dir,
        } => {
            let policy = if null_duplicate_emails {
                EmailConflictPolicy::NullDuplicates
            } else {
                settings.email_policy
            };

            let preflight = phase3::run_preflight(pool).await?;
            print!("{}", preflight.health().render());
            if preflight.is_blocking() {
                bail!("Phase 3 blocked: {}", preflight.blocking_message());
            }

            if let Some(dir) = snapshot_dir.as_deref().or(settings.snapshot_dir.as_deref()) {
                let snapshot = create_snapshot(pool, dir, "pre-phase3").await?;
                println!("Snapshot: {}", snapshot.path.display());
            }

            let outcome = phase3::apply_constraints(pool, policy).await?;
            if outcome.emails_cleared > 0 {
                println!("Cleared {} duplicate email(s)", outcome.emails_cleared);
            }
            print!("{}", outcome.validation.render());
        }

        Command::Rollback => {
            let report = rollback::rollback_constraints(pool).await;
            print!("{}", report.render());
        }

        Command::Status => {
            let status = status::identity_status(pool).await?;
            print!("{}", status.render());
        }

        Command::Snapshot { dir, label } => {
            let dir = snapshot_dir(dir, settings.snapshot_dir.as_deref())?;
            let snapshot = create_snapshot(pool, &dir, &label).await?;
            println!("✓ Snapshot {} written to {}", snapshot.id, snapshot.path.display());
        }

        Command::Snapshots { dir } => {
            let dir = snapshot_dir(dir, settings.snapshot_dir.as_deref())?;
            for snapshot in list_snapshots(&dir)? {
                println!(
                    "{}  {:<16} {}",
                    snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
                    snapshot.label,
                    snapshot.path.display()
                );
            }
        }

        Command::Restore { snapshot } => {
            let outcome = restore_snapshot(pool, &snapshot).await?;
            println!(
                "✓ Restored {} table(s), {} row(s)",
                outcome.tables_restored, outcome.rows_restored
            );
        }

        Command::Migrate { target } => {
            let runner = default_chain(settings)?;
            let applied = runner.upgrade(pool, target.as_deref()).await?;
            println!("Applied: {:?}", applied);
            println!("Current: {}", runner.current(pool).await?.unwrap_or_default());
        }

        Command::Downgrade { target } => {
            let runner = default_chain(settings)?;
            let reverted = runner.downgrade(pool, target.as_deref()).await?;
            println!("Reverted: {:?}", reverted);
            println!(
                "Current: {}",
                runner.current(pool).await?.unwrap_or_else(|| "<empty>".to_string())
            );
        }
    }

    Ok(())
}

fn snapshot_dir(cli: Option<PathBuf>, configured: Option<&Path>) -> Result<PathBuf> {
    match cli.or_else(|| configured.map(Path::to_path_buf)) {
        Some(dir) => Ok(dir),
        None => bail!("no snapshot directory: pass --dir or set migration.snapshot_dir"),
    }
}
