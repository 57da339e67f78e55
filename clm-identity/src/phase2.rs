//! Phase 2: identity data migrator
//!
//! Populates `users.firebase_uid` from `users.clerk_user_id` through an
//! [`IdentityMapper`]. Candidates are read in id-ordered keyset batches and
//! every update of a pass shares one transaction, which is committed only
//! when no row failed. A single unresolved row therefore aborts the whole
//! pass; rerunning after fixing the mapping picks up exactly the same rows.

use crate::mapping::{IdentityMapper, MappingError};
use clm_common::db::{record_migration_log, LogStatus, MigrationLogRecord, SchemaIntrospector};
use clm_common::{Error, Result};
use serde::Serialize;
use sqlx::{Connection, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Name recorded in `migration_log`
pub const BACKFILL_LOG_NAME: &str = "firebase_uid_backfill";

#[derive(Debug, Clone, Copy)]
pub struct DataMigrationOptions {
    pub batch_size: i64,
    pub dry_run: bool,
}

impl Default for DataMigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            dry_run: false,
        }
    }
}

/// Why a row was left unmigrated
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    NoMapping,
    EmptyUid,
    Provider { message: String },
    /// The resolved uid already belongs to another user
    Collision { uid: String, other_user_id: i64 },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::NoMapping => write!(f, "no mapping entry"),
            FailureReason::EmptyUid => write!(f, "mapping resolved to an empty uid"),
            FailureReason::Provider { message } => write!(f, "provider error: {}", message),
            FailureReason::Collision { uid, other_user_id } => {
                write!(f, "uid '{}' already assigned to user {}", uid, other_user_id)
            }
        }
    }
}

impl From<MappingError> for FailureReason {
    fn from(e: MappingError) -> Self {
        match e {
            MappingError::NotFound(_) => FailureReason::NoMapping,
            MappingError::EmptyUid(_) => FailureReason::EmptyUid,
            MappingError::Provider(message) => FailureReason::Provider { message },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowFailure {
    pub user_id: i64,
    pub clerk_user_id: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataMigrationReport {
    pub run_id: Uuid,
    pub candidates: usize,
    /// Rows that received a uid in this pass (before commit/rollback)
    pub migrated: usize,
    pub failures: Vec<RowFailure>,
    pub committed: bool,
    pub dry_run: bool,
}

impl DataMigrationReport {
    fn empty(run_id: Uuid, dry_run: bool) -> Self {
        Self {
            run_id,
            candidates: 0,
            migrated: 0,
            failures: Vec::new(),
            committed: false,
            dry_run,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn status(&self) -> LogStatus {
        if !self.is_success() {
            LogStatus::Failed
        } else if self.dry_run {
            LogStatus::DryRun
        } else {
            LogStatus::Success
        }
    }

    /// Failure summary stored in the migration log (first few rows only)
    fn error_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let shown: Vec<String> = self
            .failures
            .iter()
            .take(5)
            .map(|f| format!("user {} ({}): {}", f.user_id, f.clerk_user_id, f.reason))
            .collect();
        let more = self.failures.len().saturating_sub(shown.len());
        let mut summary = format!("{} unresolved row(s): {}", self.failures.len(), shown.join("; "));
        if more > 0 {
            summary.push_str(&format!("; and {} more", more));
        }
        Some(summary)
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "Firebase uid backfill (run {}{})\n  candidates: {}\n  resolved:   {}\n  failed:     {}\n",
            self.run_id,
            if self.dry_run { ", dry run" } else { "" },
            self.candidates,
            self.migrated,
            self.failures.len()
        );
        for failure in &self.failures {
            out.push_str(&format!(
                "  ✗ user {} ({}): {}\n",
                failure.user_id, failure.clerk_user_id, failure.reason
            ));
        }
        out.push_str(if self.committed {
            "Result: committed\n"
        } else if self.dry_run {
            "Result: rolled back (dry run)\n"
        } else if self.candidates == 0 {
            "Result: nothing to migrate\n"
        } else {
            "Result: rolled back - fix the mapping for the rows above and rerun\n"
        });
        out
    }
}

#[derive(Debug, sqlx::FromRow)]
struct Candidate {
    id: i64,
    clerk_user_id: String,
}

/// Run one backfill pass
pub async fn migrate_identities(
    pool: &SqlitePool,
    mapper: &dyn IdentityMapper,
    options: DataMigrationOptions,
) -> Result<DataMigrationReport> {
    if options.batch_size <= 0 {
        return Err(Error::InvalidInput(format!(
            "batch size must be positive, got {}",
            options.batch_size
        )));
    }
    if !SchemaIntrospector::column_exists(pool, "users", "firebase_uid").await? {
        return Err(Error::PreconditionFailed(
            "users.firebase_uid does not exist; run phase 1 first".to_string(),
        ));
    }

    let run_id = Uuid::new_v4();
    if !SchemaIntrospector::column_exists(pool, "users", "clerk_user_id").await? {
        info!("users.clerk_user_id is gone - identities are already finalized, nothing to migrate");
        return Ok(DataMigrationReport::empty(run_id, options.dry_run));
    }

    info!(
        "Phase 2 run {} using {}{}",
        run_id,
        mapper.describe(),
        if options.dry_run { " (dry run)" } else { "" }
    );

    let report = {
        let mut conn = pool.acquire().await?;
        backfill_pass(&mut conn, mapper, options, run_id).await?
    };

    let log_entry = MigrationLogRecord {
        migration_name: BACKFILL_LOG_NAME.to_string(),
        run_id,
        status: report.status(),
        rows_affected: if report.committed { report.migrated as i64 } else { 0 },
        error_message: report.error_summary(),
    };
    record_migration_log(pool, &log_entry).await;

    Ok(report)
}

async fn backfill_pass(
    conn: &mut SqliteConnection,
    mapper: &dyn IdentityMapper,
    options: DataMigrationOptions,
    run_id: Uuid,
) -> Result<DataMigrationReport> {
    let mut report = DataMigrationReport::empty(run_id, options.dry_run);
    let mut tx = conn.begin().await?;

    // uid -> owning user, seeded from rows that already have one
    let existing: Vec<(String, i64)> = sqlx::query_as(
        "SELECT firebase_uid, id FROM users WHERE firebase_uid IS NOT NULL AND firebase_uid <> ''",
    )
    .fetch_all(&mut *tx)
    .await?;
    let mut owners: HashMap<String, i64> = existing.into_iter().collect();

    let mut last_id = 0_i64;
    let mut batch_no = 0;
    loop {
        let batch: Vec<Candidate> = sqlx::query_as(
            r#"
            SELECT id, clerk_user_id FROM users
            WHERE id > ?
              AND clerk_user_id IS NOT NULL AND clerk_user_id <> ''
              AND (firebase_uid IS NULL OR firebase_uid = '')
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(last_id)
        .bind(options.batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let Some(last) = batch.last() else { break };
        last_id = last.id;
        batch_no += 1;

        let failed_before = report.failures.len();
        for candidate in &batch {
            report.candidates += 1;

            let uid = match mapper.resolve(&candidate.clerk_user_id).await {
                Ok(uid) => uid,
                Err(e) => {
                    warn!("  user {}: {}", candidate.id, e);
                    report.failures.push(RowFailure {
                        user_id: candidate.id,
                        clerk_user_id: candidate.clerk_user_id.clone(),
                        reason: e.into(),
                    });
                    continue;
                }
            };

            if let Some(&other_user_id) = owners.get(&uid) {
                warn!("  user {}: uid {} collides with user {}", candidate.id, uid, other_user_id);
                report.failures.push(RowFailure {
                    user_id: candidate.id,
                    clerk_user_id: candidate.clerk_user_id.clone(),
                    reason: FailureReason::Collision { uid, other_user_id },
                });
                continue;
            }

            sqlx::query("UPDATE users SET firebase_uid = ? WHERE id = ?")
                .bind(&uid)
                .bind(candidate.id)
                .execute(&mut *tx)
                .await?;
            debug!("  user {} -> {}", candidate.id, uid);
            owners.insert(uid, candidate.id);
            report.migrated += 1;
        }

        info!(
            "  Batch {}: {} row(s), {} failed",
            batch_no,
            batch.len(),
            report.failures.len() - failed_before
        );
    }

    if report.dry_run {
        tx.rollback().await?;
        info!(
            "Dry run complete: {} of {} candidate(s) resolvable, changes rolled back",
            report.migrated, report.candidates
        );
    } else if report.is_success() {
        tx.commit().await?;
        report.committed = report.candidates > 0;
        info!("✓ Phase 2 committed {} firebase uid(s)", report.migrated);
    } else {
        tx.rollback().await?;
        error!(
            "Phase 2 aborted: {} of {} row(s) unresolved, all {} update(s) rolled back",
            report.failures.len(),
            report.candidates,
            report.migrated
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::StaticMapping;
    use crate::phase1::apply_identity_columns;
    use async_trait::async_trait;
    use clm_common::db::{create_base_schema, memory_pool, recent_migration_log};

    async fn setup(users: &[&str]) -> SqlitePool {
        let pool = memory_pool().await.unwrap();
        create_base_schema(&pool).await.unwrap();
        apply_identity_columns(&pool).await.unwrap();
        for clerk_id in users {
            sqlx::query("INSERT INTO users (clerk_user_id) VALUES (?)")
                .bind(clerk_id)
                .execute(&pool)
                .await
                .unwrap();
        }
        pool
    }

    fn mapping(pairs: &[(&str, &str)]) -> StaticMapping {
        StaticMapping::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    async fn uids(pool: &SqlitePool) -> Vec<Option<String>> {
        sqlx::query_scalar("SELECT firebase_uid FROM users ORDER BY id")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_mapping_commits() {
        let pool = setup(&["user_a", "user_b", "user_c"]).await;
        let mapper = mapping(&[("user_a", "fb_a"), ("user_b", "fb_b"), ("user_c", "fb_c")]);

        let options = DataMigrationOptions { batch_size: 2, dry_run: false };
        let report = migrate_identities(&pool, &mapper, options).await.unwrap();

        assert!(report.committed);
        assert_eq!(report.candidates, 3);
        assert_eq!(report.migrated, 3);
        assert_eq!(
            uids(&pool).await,
            vec![Some("fb_a".into()), Some("fb_b".into()), Some("fb_c".into())]
        );

        let log = recent_migration_log(&pool, 1).await.unwrap();
        assert_eq!(log[0].status, "success");
        assert_eq!(log[0].rows_affected, 3);
    }

    #[tokio::test]
    async fn test_late_failure_rolls_back_whole_pass() {
        let pool = setup(&["user_a", "user_b", "user_c"]).await;
        // Last row of the last batch has no mapping
        let mapper = mapping(&[("user_a", "fb_a"), ("user_b", "fb_b")]);

        let options = DataMigrationOptions { batch_size: 2, dry_run: false };
        let report = migrate_identities(&pool, &mapper, options).await.unwrap();

        assert!(!report.committed);
        assert_eq!(report.migrated, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].user_id, 3);
        assert_eq!(report.failures[0].reason, FailureReason::NoMapping);
        assert_eq!(uids(&pool).await, vec![None, None, None]);

        let log = recent_migration_log(&pool, 1).await.unwrap();
        assert_eq!(log[0].status, "failed");
        assert!(log[0].error_message.as_deref().unwrap().contains("user_c"));
    }

    #[tokio::test]
    async fn test_collision_with_existing_uid_is_a_failure() {
        let pool = setup(&["user_a", "user_b"]).await;
        sqlx::query("UPDATE users SET firebase_uid = 'fb_taken' WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();
        let mapper = mapping(&[("user_b", "fb_taken")]);

        let report = migrate_identities(&pool, &mapper, DataMigrationOptions::default())
            .await
            .unwrap();

        assert_eq!(report.candidates, 1);
        assert_eq!(
            report.failures[0].reason,
            FailureReason::Collision { uid: "fb_taken".into(), other_user_id: 1 }
        );
        assert!(!report.committed);
    }

    #[tokio::test]
    async fn test_dry_run_never_writes() {
        let pool = setup(&["user_a"]).await;
        let mapper = mapping(&[("user_a", "fb_a")]);

        let options = DataMigrationOptions { batch_size: 10, dry_run: true };
        let report = migrate_identities(&pool, &mapper, options).await.unwrap();

        assert!(report.is_success());
        assert!(!report.committed);
        assert_eq!(report.migrated, 1);
        assert_eq!(uids(&pool).await, vec![None]);
        assert_eq!(recent_migration_log(&pool, 1).await.unwrap()[0].status, "dry_run");
    }

    #[tokio::test]
    async fn test_missing_migration_log_is_tolerated() {
        let pool = setup(&["user_a"]).await;
        sqlx::query("DROP TABLE migration_log").execute(&pool).await.unwrap();

        let report = migrate_identities(&pool, &mapping(&[("user_a", "fb_a")]), DataMigrationOptions::default())
            .await
            .unwrap();

        assert!(report.committed);
        assert_eq!(uids(&pool).await, vec![Some("fb_a".into())]);
    }

    #[tokio::test]
    async fn test_requires_phase1() {
        let pool = memory_pool().await.unwrap();
        create_base_schema(&pool).await.unwrap();

        let result = migrate_identities(&pool, &mapping(&[]), DataMigrationOptions::default()).await;
        assert!(matches!(result, Err(Error::PreconditionFailed(_))));
    }

    struct FailingProvider;

    #[async_trait]
    impl IdentityMapper for FailingProvider {
        async fn resolve(&self, _legacy_id: &str) -> std::result::Result<String, MappingError> {
            Err(MappingError::Provider("HTTP 503".to_string()))
        }

        fn describe(&self) -> String {
            "failing provider".to_string()
        }
    }

    #[tokio::test]
    async fn test_provider_errors_are_counted_per_row() {
        let pool = setup(&["user_a", "user_b"]).await;

        let report = migrate_identities(&pool, &FailingProvider, DataMigrationOptions::default())
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 2);
        assert!(matches!(report.failures[0].reason, FailureReason::Provider { .. }));
        assert!(report.render().contains("rolled back"));
    }
}
