//! clm-repair - Orphaned team repair tool
//!
//! **Usage:**
//! ```bash
//! clm-repair scan
//! clm-repair repair --sport Basketball [--dry-run] [--rules rules.toml] [--season 2024]
//! clm-repair repair-all [--dry-run]
//! ```
//!
//! Exits non-zero when orphans remain after a repair.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use clm_common::config::{resolve_database_path, TomlConfig, DB_PATH_ENV};
use clm_common::db::open_maintenance_pool;
use clm_integrity::checks::integrity_checks;
use clm_integrity::orphans::{detect_orphans, orphan_summary};
use clm_integrity::repair::{repair_all, repair_orphans, RepairOptions};
use clm_integrity::rules::{builtin_rule_tables, load_rule_tables, table_for, RuleTable};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "clm-repair", version)]
#[command(about = "Find and repair teams without an active league membership")]
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

#[derive(Args, Debug)]
struct RepairArgs {
    /// Classify and insert, then roll back
    #[arg(long)]
    dry_run: bool,

    /// TOML rule tables (default: rules_file from config, then built-ins)
    #[arg(long, value_name = "FILE")]
    rules: Option<PathBuf>,

    /// Season start year for new memberships
    #[arg(long, value_name = "YEAR")]
    season: Option<i64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report orphan counts and integrity checks
    Scan,

    /// Repair one sport
    Repair {
        /// Sport name or slug
        #[arg(long)]
        sport: String,

        #[command(flatten)]
        args: RepairArgs,
    },

    /// Repair every sport with orphans, in priority order
    RepairAll {
        #[command(flatten)]
        args: RepairArgs,
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
    info!("clm-repair v{}", env!("CARGO_PKG_VERSION"));

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
    match command {
        Command::Scan => {
            for count in orphan_summary(pool).await? {
                println!(
                    "{:<20} {:>5} team(s) {:>5} orphaned",
                    count.sport, count.total_teams, count.orphaned
                );
            }
            print!("{}", integrity_checks(pool).await?.render());
        }

        Command::Repair { sport, args } => {
            let tables = rule_tables(args.rules.as_deref(), config)?;
            let Some(table) = table_for(&tables, &sport) else {
                bail!("no rule table for sport '{}'", sport);
            };

            for team in detect_orphans(pool, &sport).await? {
                info!("Orphan: {} (#{})", team.name, team.id);
            }

            let report = repair_orphans(pool, &sport, table, options(&args, config)).await?;
            print!("{}", report.render());
            if !report.is_success() {
                bail!("{} orphaned team(s) remain in {}", report.after, report.sport);
            }
        }

        Command::RepairAll { args } => {
            let tables = rule_tables(args.rules.as_deref(), config)?;
            let reports = repair_all(pool, &tables, options(&args, config)).await?;
            for report in &reports {
                print!("{}", report.render());
            }

            let remaining: i64 = orphan_summary(pool).await?.iter().map(|c| c.orphaned).sum();
            if remaining > 0 && !args.dry_run {
                bail!("{} orphaned team(s) remain", remaining);
            }
            if reports.iter().any(|r| !r.is_success()) {
                bail!("some sports would keep orphaned teams");
            }
        }
    }

    Ok(())
}

fn options(args: &RepairArgs, config: &TomlConfig) -> RepairOptions {
    RepairOptions {
        season_start_year: args.season.unwrap_or(config.migration.season_start_year),
        dry_run: args.dry_run,
    }
}

/// `--rules`, then the configured rules file, then the built-in tables
fn rule_tables(cli: Option<&Path>, config: &TomlConfig) -> Result<Vec<RuleTable>> {
    match cli.or(config.rules_file.as_deref()) {
        Some(path) => load_rule_tables(path)
            .with_context(|| format!("Failed to load rules from {}", path.display())),
        None => Ok(builtin_rule_tables()),
    }
}
