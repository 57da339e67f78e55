//! Logical snapshot and restore
//!
//! Snapshots are taken with `VACUUM INTO`, which writes a transactionally
//! consistent copy of the live database without touching its files. Restore
//! is logical as well: the snapshot is attached and every table is recreated
//! from its schema and rows inside one transaction.

use crate::db::rebuild::quote_ident;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, SqliteConnection, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Manifest stored next to each snapshot file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: Uuid,
    pub label: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl SnapshotInfo {
    fn manifest_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }
}

/// What a restore did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreOutcome {
    pub tables_restored: usize,
    pub rows_restored: u64,
}

/// Write a consistent copy of the database into `dir`
pub async fn create_snapshot(pool: &SqlitePool, dir: &Path, label: &str) -> Result<SnapshotInfo> {
    std::fs::create_dir_all(dir)?;

    let id = Uuid::new_v4();
    let created_at = Utc::now();
    let file_name = format!(
        "{}-{}-{}.sqlite3",
        label,
        created_at.format("%Y%m%d-%H%M%S"),
        &id.simple().to_string()[..8]
    );
    let path = dir.join(file_name);

    sqlx::query("VACUUM INTO ?")
        .bind(path.to_string_lossy().to_string())
        .execute(pool)
        .await?;

    let info = SnapshotInfo {
        id,
        label: label.to_string(),
        path,
        created_at,
    };
    std::fs::write(info.manifest_path(), serde_json::to_string_pretty(&info)?)?;

    info!("✓ Snapshot '{}' written to {}", label, info.path.display());
    Ok(info)
}

/// Snapshots found in `dir`, oldest first
pub fn list_snapshots(dir: &Path) -> Result<Vec<SnapshotInfo>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut snapshots = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(&path)
            .map_err(Error::from)
            .and_then(|content| serde_json::from_str::<SnapshotInfo>(&content).map_err(Error::from))
        {
            Ok(info) => snapshots.push(info),
            Err(e) => warn!("Skipping unreadable snapshot manifest {}: {}", path.display(), e),
        }
    }

    snapshots.sort_by_key(|s| s.created_at);
    Ok(snapshots)
}

/// Replace the live database's contents with those of a snapshot
pub async fn restore_snapshot(pool: &SqlitePool, snapshot_path: &Path) -> Result<RestoreOutcome> {
    if !snapshot_path.exists() {
        return Err(Error::NotFound(format!("snapshot {}", snapshot_path.display())));
    }

    let mut conn = pool.acquire().await?;

    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(&mut *conn)
        .await?;

    let attached = sqlx::query("ATTACH DATABASE ? AS snapshot")
        .bind(snapshot_path.to_string_lossy().to_string())
        .execute(&mut *conn)
        .await;
    let result = match attached {
        Ok(_) => {
            let restored = restore_attached(&mut conn).await;
            if let Err(e) = sqlx::query("DETACH DATABASE snapshot").execute(&mut *conn).await {
                warn!("Failed to detach snapshot: {}", e);
            }
            restored
        }
        Err(e) => Err(e.into()),
    };

    // The pooled connection is reused; enforcement comes back on every path
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await?;

    let outcome = result?;
    info!(
        "✓ Restored {} tables ({} rows) from {}",
        outcome.tables_restored,
        outcome.rows_restored,
        snapshot_path.display()
    );
    Ok(outcome)
}

async fn restore_attached(conn: &mut SqliteConnection) -> Result<RestoreOutcome> {
    let mut tx = conn.begin().await?;

    let live_tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM main.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )
    .fetch_all(&mut *tx)
    .await?;
    for table in &live_tables {
        sqlx::query(&format!("DROP TABLE main.{}", quote_ident(table)))
            .execute(&mut *tx)
            .await?;
    }

    let objects: Vec<(String, String, String)> = sqlx::query_as(
        r#"
        SELECT type, name, sql FROM snapshot.sqlite_master
        WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%' AND type IN ('table', 'index', 'trigger')
        ORDER BY CASE type WHEN 'table' THEN 0 WHEN 'index' THEN 1 ELSE 2 END, rowid
        "#,
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut outcome = RestoreOutcome::default();

    for (kind, name, sql) in &objects {
        if kind != "table" {
            continue;
        }
        sqlx::query(sql).execute(&mut *tx).await?;
        let rows = sqlx::query(&format!(
            "INSERT INTO main.{table} SELECT * FROM snapshot.{table}",
            table = quote_ident(name)
        ))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        outcome.tables_restored += 1;
        outcome.rows_restored += rows;
    }

    let has_sequence: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM snapshot.sqlite_master WHERE name = 'sqlite_sequence')",
    )
    .fetch_one(&mut *tx)
    .await?;
    if has_sequence {
        sqlx::query("DELETE FROM main.sqlite_sequence")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO main.sqlite_sequence SELECT * FROM snapshot.sqlite_sequence")
            .execute(&mut *tx)
            .await?;
    }

    for (kind, _, sql) in &objects {
        if kind != "table" {
            sqlx::query(sql).execute(&mut *tx).await?;
        }
    }

    let violations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pragma_foreign_key_check")
        .fetch_one(&mut *tx)
        .await?;
    if violations > 0 {
        tx.rollback().await?;
        return Err(Error::ValidationFailed(format!(
            "restored data has {} foreign key violation(s)",
            violations
        )));
    }

    tx.commit().await?;
    Ok(outcome)
}
