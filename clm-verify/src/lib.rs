//! # clm-verify
//!
//! Read-only schema and data inventory. Connects with `mode=ro`, runs the
//! [`inventory::Inventory`] checklist plus data-health checks, and scores
//! the result as a compliance percentage.

pub mod db;
pub mod inventory;
pub mod report;

use clm_common::db::SchemaIntrospector;
use clm_common::{CheckResult, HealthReport, Result};
use clm_identity::phase3::run_preflight;
use clm_integrity::checks::integrity_checks;
use inventory::Inventory;
use report::VerificationReport;
use sqlx::SqlitePool;
use std::path::Path;

/// Identity invariants: no null or duplicate `firebase_uid`, no duplicate
/// present email
pub async fn identity_checks(pool: &SqlitePool) -> Result<HealthReport> {
    if !SchemaIntrospector::table_exists(pool, "users").await? {
        let mut report = HealthReport::new();
        report.push(CheckResult::fail("identity:users", "data", "users table missing"));
        return Ok(report);
    }
    if !SchemaIntrospector::column_exists(pool, "users", "firebase_uid").await? {
        let mut report = HealthReport::new();
        report.push(CheckResult::fail(
            "identity:firebase_uid",
            "data",
            "users.firebase_uid missing; identity migration not started",
        ));
        return Ok(report);
    }

    let mut report = run_preflight(pool).await?.health();
    for check in &mut report.checks {
        check.category = "data".to_string();
    }
    Ok(report)
}

/// Full inventory: schema checklist, identity data, referential integrity
pub async fn verify(pool: &SqlitePool, database_path: &Path) -> Result<VerificationReport> {
    let mut checks = Inventory::default().check(pool).await?;
    checks.extend(identity_checks(pool).await?);
    checks.extend(integrity_checks(pool).await?);
    Ok(VerificationReport::new(database_path, checks))
}
