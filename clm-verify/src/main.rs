//! clm-verify - Read-only schema and constraint inventory
//!
//! **Usage:**
//! ```bash
//! clm-verify --db-path clm.db [--json-output report.json] [--gate]
//! ```
//!
//! Without `--gate` the exit code is zero whatever the compliance score.

use anyhow::{bail, Context, Result};
use clap::Parser;
use clm_common::config::{resolve_database_path, TomlConfig, DB_PATH_ENV};
use clm_verify::db::connect_readonly;
use clm_verify::verify;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "clm-verify", version)]
#[command(about = "Verify the database schema, constraints and data health (read-only)")]
struct Cli {
    /// Database file (overrides CLM_DB_PATH and the config file)
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// TOML config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Also write the report as JSON
    #[arg(long, value_name = "FILE")]
    json_output: Option<PathBuf>,

    /// Exit non-zero unless every check passes
    #[arg(long)]
    gate: bool,
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
    info!("clm-verify v{}", env!("CARGO_PKG_VERSION"));

    let config = TomlConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let db_path = resolve_database_path(cli.db_path.as_deref(), DB_PATH_ENV, &config);

    let pool = match connect_readonly(&db_path).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            return Err(e.into());
        }
    };

    let report = verify(&pool, &db_path).await;
    pool.close().await;
    let report = report.context("Verification failed to run")?;

    print!("{}", report.render());
    if let Some(path) = &cli.json_output {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    if cli.gate && !report.is_compliant() {
        bail!(
            "{} check(s) failed, compliance {:.1}%",
            report.failed,
            report.compliance_percent
        );
    }
    Ok(())
}
