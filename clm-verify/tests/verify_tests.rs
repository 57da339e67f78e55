//! Verifier against databases at different migration stages

use clm_common::config::MigrationSettings;
use clm_common::db::open_maintenance_pool;
use clm_common::CheckStatus;
use clm_identity::default_chain;
use clm_identity::mapping::StaticMapping;
use clm_identity::phase2::{migrate_identities, DataMigrationOptions};
use clm_verify::db::connect_readonly;
use clm_verify::report::VerificationReport;
use clm_verify::verify;
use std::path::Path;

/// Build a database migrated up to `target` (or fully), with catalog and
/// user rows, then close the writer
async fn build_database(path: &Path, target: Option<&str>) {
    let pool = open_maintenance_pool(path).await.unwrap();
    let runner = default_chain(&MigrationSettings::default()).unwrap();

    runner.upgrade(&pool, Some("0001_initial_schema")).await.unwrap();
    for statement in [
        "INSERT INTO sports (id, name, slug) VALUES (1, 'Basketball', 'basketball')",
        "INSERT INTO leagues (id, sport_id, name, slug) VALUES (1, 1, 'National Basketball Association', 'nba')",
        "INSERT INTO teams (sport_id, league_id, name, market) VALUES \
         (1, 1, 'Lakers', 'Los Angeles'), (1, 1, 'Celtics', 'Boston')",
        "INSERT INTO users (clerk_user_id, email) VALUES \
         ('user_a', 'a@example.com'), ('user_b', NULL), ('user_c', '')",
    ] {
        sqlx::query(statement).execute(&pool).await.unwrap();
    }

    runner
        .upgrade(&pool, Some("0003_firebase_identity_columns"))
        .await
        .unwrap();

    if target != Some("0003_firebase_identity_columns") {
        let mapper = StaticMapping::from_json_str(
            r#"{"user_a": "fb_a", "user_b": "fb_b", "user_c": "fb_c"}"#,
        )
        .unwrap();
        let report = migrate_identities(&pool, &mapper, DataMigrationOptions::default())
            .await
            .unwrap();
        assert!(report.committed);
        runner.upgrade(&pool, target).await.unwrap();
    }

    pool.close().await;
}

fn status_of(report: &VerificationReport, name: &str) -> CheckStatus {
    report
        .checks
        .checks
        .iter()
        .find(|c| c.name == name)
        .unwrap_or_else(|| panic!("no check {}", name))
        .status
}

#[tokio::test]
async fn test_fully_migrated_database_is_compliant() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clm.db");
    build_database(&path, None).await;

    let pool = connect_readonly(&path).await.unwrap();
    let report = verify(&pool, &path).await.unwrap();

    assert!(report.is_compliant(), "{}", report.render());
    assert_eq!(report.compliance_percent, 100.0);
    assert_eq!(status_of(&report, "index:uq_users_firebase_uid"), CheckStatus::Pass);
    assert_eq!(status_of(&report, "index:ux_users_email_present"), CheckStatus::Pass);
    assert_eq!(status_of(&report, "retired:users.clerk_user_id"), CheckStatus::Pass);
    assert_eq!(status_of(&report, "orphans:Basketball"), CheckStatus::Pass);

    let json = dir.path().join("report.json");
    report.write_json(&json).unwrap();
    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
    assert_eq!(value["failed"], 0);
}

#[tokio::test]
async fn test_phase1_database_reports_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clm.db");
    build_database(&path, Some("0003_firebase_identity_columns")).await;

    let pool = connect_readonly(&path).await.unwrap();
    let report = verify(&pool, &path).await.unwrap();

    assert!(!report.is_compliant());
    assert!(report.compliance_percent < 100.0);
    assert_eq!(status_of(&report, "columns:users"), CheckStatus::Fail);
    assert_eq!(status_of(&report, "retired:users.clerk_user_id"), CheckStatus::Fail);
    assert_eq!(status_of(&report, "index:uq_users_firebase_uid"), CheckStatus::Fail);
    assert_eq!(
        status_of(&report, "identity:missing_firebase_uid"),
        CheckStatus::Fail
    );
    // Catalog side is already healthy
    assert_eq!(status_of(&report, "orphans:Basketball"), CheckStatus::Pass);
    assert_eq!(status_of(&report, "foreign_key_check"), CheckStatus::Pass);
}

#[tokio::test]
async fn test_verification_does_not_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clm.db");
    build_database(&path, None).await;

    let pool = connect_readonly(&path).await.unwrap();
    verify(&pool, &path).await.unwrap();

    let result = sqlx::query("DELETE FROM users").execute(&pool).await;
    assert!(result.is_err());
    pool.close().await;

    let writer = open_maintenance_pool(&path).await.unwrap();
    let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&writer)
        .await
        .unwrap();
    assert_eq!(users, 3);
}
