//! Orphaned team repair
//!
//! Every orphan of a sport is classified through that sport's [`RuleTable`]
//! and given one active membership for the configured season. All inserts of
//! a run share a transaction; a dry run rolls it back after measuring the
//! outcome.
//!
//! The insert is conditioned on the team still having no active membership,
//! and an inactive row for the same (team, league, season) is reactivated
//! instead of duplicated, so rerunning a repair inserts nothing.

use crate::orphans::{find_sport, orphan_summary, orphans_for_sport, require_memberships_table, OrphanedTeam};
use crate::rules::{table_for, MatchedRule, RuleTable, TeamText};
use clm_common::db::{record_migration_log, League, LogStatus, MigrationLogRecord};
use clm_common::{Error, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const REPAIR_LOG_NAME: &str = "orphan_repair";

const INSERT_MEMBERSHIP: &str = r#"
    INSERT INTO team_league_memberships (team_id, league_id, season_start_year, is_active)
    SELECT ?, ?, ?, 1
    WHERE NOT EXISTS (
        SELECT 1 FROM team_league_memberships
        WHERE team_id = ? AND is_active = 1
    )
    ON CONFLICT (team_id, league_id, season_start_year) DO UPDATE SET is_active = 1
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairOptions {
    pub season_start_year: i64,
    pub dry_run: bool,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            season_start_year: 2024,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairedTeam {
    pub team_id: i64,
    pub team_name: String,
    pub league_id: i64,
    pub league_slug: String,
    pub matched_rule: MatchedRule,
    /// Classified league was missing; the table default was used instead
    pub used_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedTeam {
    pub team_id: i64,
    pub team_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairReport {
    pub sport: String,
    pub rule_table_version: u32,
    pub season_start_year: i64,
    /// Orphans found before the repair
    pub before: usize,
    /// Orphans left afterwards (projected, for a dry run)
    pub after: usize,
    pub inserted: Vec<RepairedTeam>,
    pub unresolved: Vec<UnresolvedTeam>,
    pub dry_run: bool,
}

impl RepairReport {
    pub fn is_success(&self) -> bool {
        self.after == 0
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "{} (rules v{}, season {}{}):\n",
            self.sport,
            self.rule_table_version,
            self.season_start_year,
            if self.dry_run { ", dry run" } else { "" }
        );
        out.push_str(&format!("  orphans before: {}\n", self.before));
        for team in &self.inserted {
            let via = match team.matched_rule {
                MatchedRule::Rule(index) => format!("rule {}", index),
                MatchedRule::Default => "default".to_string(),
            };
            out.push_str(&format!(
                "  + {} (#{}) -> {} [{}{}]\n",
                team.team_name,
                team.team_id,
                team.league_slug,
                via,
                if team.used_default { ", fallback" } else { "" }
            ));
        }
        for team in &self.unresolved {
            out.push_str(&format!(
                "  ? {} (#{}): {}\n",
                team.team_name, team.team_id, team.reason
            ));
        }
        out.push_str(&format!(
            "  orphans after: {} {}\n",
            self.after,
            if self.is_success() { "✓" } else { "✗" }
        ));
        out
    }
}

/// A resolved target for one orphan
struct PlannedMembership<'a> {
    team: &'a OrphanedTeam,
    league: &'a League,
    matched_rule: MatchedRule,
    used_default: bool,
}

async fn active_leagues(pool: &SqlitePool, sport_id: i64) -> Result<HashMap<String, League>> {
    let leagues: Vec<League> = sqlx::query_as(
        "SELECT id, sport_id, name, slug, competition_type, is_active \
         FROM leagues WHERE sport_id = ? AND is_active = 1",
    )
    .bind(sport_id)
    .fetch_all(pool)
    .await?;

    Ok(leagues
        .into_iter()
        .map(|league| (league.slug.to_lowercase(), league))
        .collect())
}

/// Give every orphan of `sport` an active membership
pub async fn repair_orphans(
    pool: &SqlitePool,
    sport: &str,
    table: &RuleTable,
    options: RepairOptions,
) -> Result<RepairReport> {
    require_memberships_table(pool).await?;
    let sport = find_sport(pool, sport).await?;
    if !table.applies_to(&sport.name) {
        return Err(Error::InvalidInput(format!(
            "rule table for '{}' cannot repair '{}'",
            table.sport, sport.name
        )));
    }

    let orphans = orphans_for_sport(pool, sport.id).await?;
    let leagues = active_leagues(pool, sport.id).await?;
    info!(
        "Repairing {}: {} orphan(s), {} active league(s), rules v{}",
        sport.name,
        orphans.len(),
        leagues.len(),
        table.version
    );

    let mut report = RepairReport {
        sport: sport.name.clone(),
        rule_table_version: table.version,
        season_start_year: options.season_start_year,
        before: orphans.len(),
        after: orphans.len(),
        inserted: Vec::new(),
        unresolved: Vec::new(),
        dry_run: options.dry_run,
    };

    let mut plan = Vec::with_capacity(orphans.len());
    for team in &orphans {
        let classification = table.classify(&TeamText::from(team));
        if let Some(league) = leagues.get(&classification.league_slug.to_lowercase()) {
            plan.push(PlannedMembership {
                team,
                league,
                matched_rule: classification.matched_rule,
                used_default: false,
            });
        } else if let Some(league) = leagues.get(&table.default_league_slug.to_lowercase()) {
            warn!(
                "League '{}' not found for {} (#{}), using default '{}'",
                classification.league_slug, team.name, team.id, table.default_league_slug
            );
            plan.push(PlannedMembership {
                team,
                league,
                matched_rule: MatchedRule::Default,
                used_default: true,
            });
        } else {
            warn!(
                "No league for {} (#{}): neither '{}' nor default '{}' exists",
                team.name, team.id, classification.league_slug, table.default_league_slug
            );
            report.unresolved.push(UnresolvedTeam {
                team_id: team.id,
                team_name: team.name.clone(),
                reason: format!(
                    "neither '{}' nor default '{}' is an active {} league",
                    classification.league_slug, table.default_league_slug, sport.name
                ),
            });
        }
    }

    let mut tx = pool.begin().await?;
    for planned in &plan {
        let affected = sqlx::query(INSERT_MEMBERSHIP)
            .bind(planned.team.id)
            .bind(planned.league.id)
            .bind(options.season_start_year)
            .bind(planned.team.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if affected == 0 {
            debug!("{} (#{}) already has an active membership", planned.team.name, planned.team.id);
            continue;
        }
        report.inserted.push(RepairedTeam {
            team_id: planned.team.id,
            team_name: planned.team.name.clone(),
            league_id: planned.league.id,
            league_slug: planned.league.slug.clone(),
            matched_rule: planned.matched_rule,
            used_default: planned.used_default,
        });
    }

    report.after = orphans_for_sport(&mut *tx, sport.id).await?.len();

    if options.dry_run {
        tx.rollback().await?;
        info!(
            "Dry run: {} membership(s) would be created, changes rolled back",
            report.inserted.len()
        );
    } else {
        tx.commit().await?;
        info!("✓ {}: {} membership(s) created", sport.name, report.inserted.len());
    }

    if report.is_success() {
        info!("✓ {} has no orphaned teams", sport.name);
    } else {
        warn!("{}: {} orphaned team(s) remain", sport.name, report.after);
    }

    let status = if options.dry_run {
        LogStatus::DryRun
    } else if report.is_success() {
        LogStatus::Success
    } else {
        LogStatus::Failed
    };
    let log_entry = MigrationLogRecord {
        migration_name: format!("{}:{}", REPAIR_LOG_NAME, sport.slug),
        run_id: Uuid::new_v4(),
        status,
        rows_affected: if options.dry_run { 0 } else { report.inserted.len() as i64 },
        error_message: (!report.is_success())
            .then(|| format!("{} orphaned team(s) remain", report.after)),
    };
    record_migration_log(pool, &log_entry).await;

    Ok(report)
}

/// Repair every sport that has orphans, in priority order
///
/// Sports without a rule table are skipped with a warning.
pub async fn repair_all(
    pool: &SqlitePool,
    tables: &[RuleTable],
    options: RepairOptions,
) -> Result<Vec<RepairReport>> {
    let mut reports = Vec::new();

    for count in orphan_summary(pool).await? {
        if count.orphaned == 0 {
            debug!("{}: no orphans", count.sport);
            continue;
        }
        let Some(table) = table_for(tables, &count.sport) else {
            warn!(
                "No rule table for {}; {} orphan(s) left untouched",
                count.sport, count.orphaned
            );
            continue;
        };
        reports.push(repair_orphans(pool, &count.sport, table, options).await?);
    }

    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orphans::detect_orphans;
    use crate::rules::{builtin_rule_tables, Matcher, Rule};
    use crate::test_support::seeded_pool;

    fn builtin(sport: &str) -> RuleTable {
        table_for(&builtin_rule_tables(), sport).unwrap().clone()
    }

    async fn active_memberships(pool: &SqlitePool, team_id: i64) -> Vec<(i64, i64)> {
        sqlx::query_as(
            "SELECT league_id, season_start_year FROM team_league_memberships \
             WHERE team_id = ? AND is_active = 1",
        )
        .bind(team_id)
        .fetch_all(pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_repair_basketball() {
        let pool = seeded_pool().await;

        let report = repair_orphans(&pool, "Basketball", &builtin("Basketball"), RepairOptions::default())
            .await
            .unwrap();

        assert_eq!(report.before, 2);
        assert_eq!(report.after, 0);
        assert!(report.is_success());
        let names: Vec<&str> = report.inserted.iter().map(|t| t.team_name.as_str()).collect();
        assert_eq!(names, vec!["Celtics", "Knicks"]);
        assert_eq!(active_memberships(&pool, 2).await, vec![(2, 2024)]);

        // Lakers keep their single membership
        assert_eq!(active_memberships(&pool, 1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_repair_is_idempotent() {
        let pool = seeded_pool().await;
        let table = builtin("College Football");

        let first = repair_orphans(&pool, "College Football", &table, RepairOptions::default())
            .await
            .unwrap();
        assert_eq!(first.inserted.len(), 3);

        let second = repair_orphans(&pool, "College Football", &table, RepairOptions::default())
            .await
            .unwrap();
        assert_eq!(second.before, 0);
        assert!(second.inserted.is_empty());

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM team_league_memberships")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_conference_classification() {
        let pool = seeded_pool().await;

        let report = repair_orphans(&pool, "college-football", &builtin("College Football"), RepairOptions::default())
            .await
            .unwrap();

        let slugs: Vec<(&str, &str)> = report
            .inserted
            .iter()
            .map(|t| (t.team_name.as_str(), t.league_slug.as_str()))
            .collect();
        assert_eq!(
            slugs,
            vec![
                ("Crimson Tide", "sec"),
                ("Buckeyes", "big-ten"),
                ("Midshipmen", "ncaa-fbs"),
            ]
        );
        assert_eq!(report.inserted[2].matched_rule, MatchedRule::Default);
        assert!(!report.inserted[2].used_default);
    }

    #[tokio::test]
    async fn test_missing_league_falls_back_to_default() {
        let pool = seeded_pool().await;
        let table = RuleTable {
            version: 1,
            sport: "College Football".to_string(),
            rules: vec![Rule {
                matcher: Matcher::market("Navy"),
                league_slug: "american".to_string(),
            }],
            default_league_slug: "ncaa-fbs".to_string(),
        };

        let report = repair_orphans(&pool, "College Football", &table, RepairOptions::default())
            .await
            .unwrap();

        let navy = report.inserted.iter().find(|t| t.team_name == "Midshipmen").unwrap();
        assert_eq!(navy.league_slug, "ncaa-fbs");
        assert!(navy.used_default);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_unresolvable_team_is_reported() {
        let pool = seeded_pool().await;
        let table = RuleTable {
            version: 1,
            sport: "Basketball".to_string(),
            rules: vec![Rule {
                matcher: Matcher::name("Celtics"),
                league_slug: "nba".to_string(),
            }],
            default_league_slug: "wnba".to_string(),
        };

        let report = repair_orphans(&pool, "Basketball", &table, RepairOptions::default())
            .await
            .unwrap();

        assert_eq!(report.inserted.len(), 1);
        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].team_name, "Knicks");
        assert_eq!(report.after, 1);
        assert!(!report.is_success());
        assert!(report.render().contains("? Knicks"));
    }

    #[tokio::test]
    async fn test_dry_run_projects_without_writing() {
        let pool = seeded_pool().await;

        let report = repair_orphans(
            &pool,
            "Basketball",
            &builtin("Basketball"),
            RepairOptions {
                season_start_year: 2025,
                dry_run: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(report.inserted.len(), 2);
        assert_eq!(report.after, 0);
        assert_eq!(detect_orphans(&pool, "Basketball").await.unwrap().len(), 2);

        let logged: String = sqlx::query_scalar(
            "SELECT status FROM migration_log WHERE migration_name = 'orphan_repair:basketball'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(logged, "dry_run");
    }

    #[tokio::test]
    async fn test_inactive_membership_is_reactivated() {
        let pool = seeded_pool().await;
        sqlx::query(
            "INSERT INTO team_league_memberships (team_id, league_id, season_start_year, is_active) \
             VALUES (2, 2, 2024, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let report = repair_orphans(&pool, "Basketball", &builtin("Basketball"), RepairOptions::default())
            .await
            .unwrap();
        assert_eq!(report.inserted.len(), 2);

        let rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM team_league_memberships WHERE team_id = 2")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(active_memberships(&pool, 2).await, vec![(2, 2024)]);
    }

    #[tokio::test]
    async fn test_wrong_table_is_rejected() {
        let pool = seeded_pool().await;
        let result = repair_orphans(&pool, "Hockey", &builtin("Basketball"), RepairOptions::default()).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_repair_all_skips_sports_without_rules() {
        let pool = seeded_pool().await;
        let tables = vec![builtin("Basketball")];

        let reports = repair_all(&pool, &tables, RepairOptions::default()).await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].sport, "Basketball");
        assert_eq!(detect_orphans(&pool, "College Football").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_repair_all_priority_order() {
        let pool = seeded_pool().await;
        // Orphan the Bruins too
        sqlx::query("UPDATE team_league_memberships SET is_active = 0 WHERE team_id = 4")
            .execute(&pool)
            .await
            .unwrap();

        let reports = repair_all(&pool, &builtin_rule_tables(), RepairOptions::default())
            .await
            .unwrap();

        let sports: Vec<&str> = reports.iter().map(|r| r.sport.as_str()).collect();
        assert_eq!(sports, vec!["Basketball", "Hockey", "College Football"]);
        assert!(reports.iter().all(RepairReport::is_success));
    }
}
