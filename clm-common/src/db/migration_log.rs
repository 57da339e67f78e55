//! Durable migration log
//!
//! Best-effort sink: a failed write (including a missing `migration_log`
//! table) is logged and swallowed so it can never fail a migration.

use crate::db::models::MigrationLogEntry;
use crate::db::schema_sync::SchemaIntrospector;
use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

/// Final status of a logged run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Success,
    Failed,
    DryRun,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Failed => "failed",
            LogStatus::DryRun => "dry_run",
        }
    }
}

/// Record to append to `migration_log`
#[derive(Debug, Clone)]
pub struct MigrationLogRecord {
    pub migration_name: String,
    pub run_id: Uuid,
    pub status: LogStatus,
    pub rows_affected: i64,
    pub error_message: Option<String>,
}

/// Append a record; returns whether it was written
pub async fn record_migration_log(pool: &SqlitePool, record: &MigrationLogRecord) -> bool {
    let result = sqlx::query(
        r#"
        INSERT INTO migration_log (migration_name, run_id, status, rows_affected, error_message)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.migration_name)
    .bind(record.run_id.to_string())
    .bind(record.status.as_str())
    .bind(record.rows_affected)
    .bind(&record.error_message)
    .execute(pool)
    .await;

    match result {
        Ok(_) => {
            info!(
                "Logged {} run {} ({})",
                record.migration_name,
                record.run_id,
                record.status.as_str()
            );
            true
        }
        Err(e) => {
            warn!("Could not write migration_log record (continuing): {}", e);
            false
        }
    }
}

/// Most recent log entries, newest first; empty when the table is absent
pub async fn recent_migration_log(pool: &SqlitePool, limit: i64) -> Result<Vec<MigrationLogEntry>> {
    if !SchemaIntrospector::table_exists(pool, "migration_log").await? {
        return Ok(Vec::new());
    }

    let entries = sqlx::query_as(
        r#"
        SELECT id, migration_name, run_id, status, rows_affected, error_message, created_at
        FROM migration_log
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::{create_migration_log_table, memory_pool};

    fn record(status: LogStatus) -> MigrationLogRecord {
        MigrationLogRecord {
            migration_name: "firebase_uid_backfill".to_string(),
            run_id: Uuid::new_v4(),
            status,
            rows_affected: 3,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_record_and_read_back() {
        let pool = memory_pool().await.unwrap();
        create_migration_log_table(&pool).await.unwrap();

        assert!(record_migration_log(&pool, &record(LogStatus::Success)).await);
        assert!(record_migration_log(&pool, &record(LogStatus::Failed)).await);

        let entries = recent_migration_log(&pool, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, "failed");
        assert_eq!(entries[1].status, "success");
        assert_eq!(entries[1].rows_affected, 3);
    }

    #[tokio::test]
    async fn test_missing_table_is_swallowed() {
        let pool = memory_pool().await.unwrap();

        assert!(!record_migration_log(&pool, &record(LogStatus::Success)).await);
        assert!(recent_migration_log(&pool, 10).await.unwrap().is_empty());
    }
}
