//! Read-only database access

use clm_common::{Error, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

/// Connect with SQLite `mode=ro`; any write through this pool fails
pub async fn connect_readonly(db_path: &Path) -> Result<SqlitePool> {
    if !db_path.exists() {
        return Err(Error::NotFound(format!("database {}", db_path.display())));
    }

    let db_url = format!("sqlite://{}?mode=ro", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await?;

    let write_test = sqlx::query("CREATE TABLE _clm_verify_write_probe (id INTEGER)")
        .execute(&pool)
        .await;
    if write_test.is_ok() {
        return Err(Error::Internal(format!(
            "{} accepted a write on a read-only connection",
            db_path.display()
        )));
    }

    info!("✓ Connected to {} (read-only)", db_path.display());
    Ok(pool)
}
