//! Constraint rollback
//!
//! Reverses Phase 3's constraints only: the uid unique index, the NOT NULL
//! on `firebase_uid` and the partial unique email index. The legacy
//! `clerk_user_id` column is not re-created and no data moves back; a full
//! return to the pre-Phase-3 state needs a snapshot restore.
//!
//! Every step is guarded on its own. A step that fails (or finds nothing to
//! undo after a partial forward run) is logged and recorded, and the
//! remaining steps still run.

use crate::phase3::{EMAIL_UNIQUE_INDEX, UID_UNIQUE_INDEX};
use clm_common::db::{quote_ident, rebuild_table, RebuildSpec, SchemaIntrospector};
use clm_common::Result;
use serde::Serialize;
use sqlx::{Connection, SqliteConnection, SqlitePool};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Applied,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackStep {
    pub name: &'static str,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RollbackReport {
    pub steps: Vec<RollbackStep>,
}

impl RollbackReport {
    pub fn has_failures(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.outcome, StepOutcome::Failed(_)))
    }

    pub fn outcome_of(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.name == name).map(|s| &s.outcome)
    }

    pub fn render(&self) -> String {
        let mut out = String::from("Constraint rollback\n");
        for step in &self.steps {
            let line = match &step.outcome {
                StepOutcome::Applied => format!("  ✓ {}\n", step.name),
                StepOutcome::Skipped(why) => format!("  - {} (skipped: {})\n", step.name, why),
                StepOutcome::Failed(why) => format!("  ✗ {} (failed: {})\n", step.name, why),
            };
            out.push_str(&line);
        }
        out.push_str("Note: users.clerk_user_id is not restored; use a snapshot restore for that\n");
        out
    }

    fn record(&mut self, name: &'static str, result: Result<StepOutcome>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("⚠ Rollback step '{}' failed, continuing: {}", name, e);
                StepOutcome::Failed(e.to_string())
            }
        };
        if let StepOutcome::Skipped(why) = &outcome {
            info!("  Rollback step '{}' skipped: {}", name, why);
        }
        self.steps.push(RollbackStep { name, outcome });
    }
}

pub const STEP_DROP_UID_UNIQUE: &str = "drop_uid_unique_index";
pub const STEP_UID_NULLABLE: &str = "make_firebase_uid_nullable";
pub const STEP_DROP_EMAIL_UNIQUE: &str = "drop_email_unique_index";

/// Undo Phase 3 constraints; never fails as a whole
pub async fn rollback_constraints(pool: &SqlitePool) -> RollbackReport {
    let mut report = RollbackReport::default();

    report.record(STEP_DROP_UID_UNIQUE, drop_index(pool, UID_UNIQUE_INDEX).await);
    report.record(STEP_UID_NULLABLE, make_uid_nullable(pool).await);
    report.record(STEP_DROP_EMAIL_UNIQUE, drop_index(pool, EMAIL_UNIQUE_INDEX).await);

    if report.has_failures() {
        warn!("Constraint rollback finished with failed steps");
    } else {
        info!("✓ Constraint rollback finished");
    }
    report
}

async fn drop_index(pool: &SqlitePool, name: &str) -> Result<StepOutcome> {
    if !SchemaIntrospector::index_exists(pool, name).await? {
        return Ok(StepOutcome::Skipped(format!("index {} not present", name)));
    }
    sqlx::query(&format!("DROP INDEX {}", quote_ident(name)))
        .execute(pool)
        .await?;
    info!("  ✓ Dropped index {}", name);
    Ok(StepOutcome::Applied)
}

async fn make_uid_nullable(pool: &SqlitePool) -> Result<StepOutcome> {
    let columns = SchemaIntrospector::introspect_table(pool, "users").await?;
    match columns.iter().find(|c| c.name == "firebase_uid") {
        None => return Ok(StepOutcome::Skipped("users.firebase_uid not present".to_string())),
        Some(column) if !column.not_null => {
            return Ok(StepOutcome::Skipped("users.firebase_uid already nullable".to_string()))
        }
        Some(_) => {}
    }

    let mut conn = pool.acquire().await?;
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(&mut *conn)
        .await?;
    let rebuilt = rebuild_nullable(&mut conn).await;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await?;
    rebuilt?;

    Ok(StepOutcome::Applied)
}

async fn rebuild_nullable(conn: &mut SqliteConnection) -> Result<()> {
    let mut tx = conn.begin().await?;
    rebuild_table(&mut tx, &RebuildSpec::new("users").set_not_null("firebase_uid", false)).await?;
    tx.commit().await?;
    Ok(())
}
