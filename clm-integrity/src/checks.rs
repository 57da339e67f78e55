//! Post-repair integrity checks
//!
//! Each function returns plain [`CheckResult`]s so the inventory verifier
//! can fold them into its own report.

use crate::orphans::orphan_summary;
use clm_common::db::SchemaIntrospector;
use clm_common::{CheckResult, HealthReport, Result};
use sqlx::SqlitePool;

pub const CATEGORY: &str = "integrity";

/// One check per sport; any orphan fails
pub async fn orphan_checks(pool: &SqlitePool) -> Result<Vec<CheckResult>> {
    let checks = orphan_summary(pool)
        .await?
        .into_iter()
        .map(|count| {
            let mut check = CheckResult::from_count(
                format!("orphans:{}", count.sport),
                CATEGORY,
                count.orphaned,
                true,
                "orphaned team(s)",
            );
            check.detail = format!("{} of {} team(s) orphaned", count.orphaned, count.total_teams);
            check
        })
        .collect();
    Ok(checks)
}

/// Memberships pointing at missing teams or leagues, and at leagues of
/// another sport (warning only)
pub async fn membership_checks(pool: &SqlitePool) -> Result<Vec<CheckResult>> {
    let missing_teams: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM team_league_memberships m \
         WHERE NOT EXISTS (SELECT 1 FROM teams t WHERE t.id = m.team_id)",
    )
    .fetch_one(pool)
    .await?;

    let missing_leagues: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM team_league_memberships m \
         WHERE NOT EXISTS (SELECT 1 FROM leagues l WHERE l.id = m.league_id)",
    )
    .fetch_one(pool)
    .await?;

    let cross_sport: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM team_league_memberships m
        JOIN teams t ON t.id = m.team_id
        JOIN leagues l ON l.id = m.league_id
        WHERE m.is_active = 1 AND t.sport_id <> l.sport_id
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(vec![
        CheckResult::from_count(
            "memberships:missing_team",
            CATEGORY,
            missing_teams,
            true,
            "membership(s) referencing a missing team",
        ),
        CheckResult::from_count(
            "memberships:missing_league",
            CATEGORY,
            missing_leagues,
            true,
            "membership(s) referencing a missing league",
        ),
        CheckResult::from_count(
            "memberships:cross_sport",
            CATEGORY,
            cross_sport,
            false,
            "active membership(s) in another sport's league",
        ),
    ])
}

/// `PRAGMA foreign_key_check` over the whole database
pub async fn foreign_key_check(pool: &SqlitePool) -> Result<CheckResult> {
    let violations = sqlx::query("PRAGMA foreign_key_check").fetch_all(pool).await?;
    Ok(CheckResult::from_count(
        "foreign_key_check",
        CATEGORY,
        violations.len() as i64,
        true,
        "foreign key violation(s)",
    ))
}

/// Every integrity check; a missing membership table is a single failure
pub async fn integrity_checks(pool: &SqlitePool) -> Result<HealthReport> {
    let mut report = HealthReport::new();

    if !SchemaIntrospector::table_exists(pool, "team_league_memberships").await? {
        report.push(CheckResult::fail(
            "table:team_league_memberships",
            CATEGORY,
            "missing; orphan detection needs migration 0002",
        ));
        report.push(foreign_key_check(pool).await?);
        return Ok(report);
    }

    for check in orphan_checks(pool).await? {
        report.push(check);
    }
    for check in membership_checks(pool).await? {
        report.push(check);
    }
    report.push(foreign_key_check(pool).await?);

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::{repair_all, RepairOptions};
    use crate::rules::builtin_rule_tables;
    use crate::test_support::seeded_pool;
    use clm_common::CheckStatus;

    fn status_of(report: &HealthReport, name: &str) -> CheckStatus {
        report
            .checks
            .iter()
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("no check {}", name))
            .status
    }

    #[tokio::test]
    async fn test_orphans_fail_until_repaired() {
        let pool = seeded_pool().await;

        let before = integrity_checks(&pool).await.unwrap();
        assert_eq!(status_of(&before, "orphans:Basketball"), CheckStatus::Fail);
        assert_eq!(status_of(&before, "orphans:Hockey"), CheckStatus::Pass);
        assert_eq!(status_of(&before, "foreign_key_check"), CheckStatus::Pass);
        assert_eq!(before.failed(), 2);

        repair_all(&pool, &builtin_rule_tables(), RepairOptions::default())
            .await
            .unwrap();

        let after = integrity_checks(&pool).await.unwrap();
        assert!(after.is_compliant(), "{}", after.render());
    }

    #[tokio::test]
    async fn test_dangling_and_cross_sport_memberships() {
        let pool = seeded_pool().await;
        sqlx::query("PRAGMA foreign_keys = OFF").execute(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO team_league_memberships (team_id, league_id, season_start_year) VALUES \
             (99, 2, 2024), \
             (2, 42, 2024), \
             (3, 1, 2024)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await.unwrap();

        let report = integrity_checks(&pool).await.unwrap();
        assert_eq!(status_of(&report, "memberships:missing_team"), CheckStatus::Fail);
        assert_eq!(status_of(&report, "memberships:missing_league"), CheckStatus::Fail);
        assert_eq!(status_of(&report, "memberships:cross_sport"), CheckStatus::Warn);
        assert_eq!(status_of(&report, "foreign_key_check"), CheckStatus::Fail);
    }

    #[tokio::test]
    async fn test_missing_memberships_table() {
        let pool = seeded_pool().await;
        sqlx::query("DROP TABLE team_league_memberships")
            .execute(&pool)
            .await
            .unwrap();

        let report = integrity_checks(&pool).await.unwrap();
        assert_eq!(
            status_of(&report, "table:team_league_memberships"),
            CheckStatus::Fail
        );
    }
}
