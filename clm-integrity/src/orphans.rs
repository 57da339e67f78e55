//! Orphaned team detection
//!
//! A team is orphaned when no active row of `team_league_memberships`
//! points at it. Onboarding and search join through memberships, so an
//! orphan is invisible to users.

use clm_common::db::{SchemaIntrospector, Sport};
use clm_common::{Error, Result};
use serde::Serialize;
use sqlx::{Executor, Sqlite, SqlitePool};

/// Sports in repair priority order; anything else sorts after, by name
pub const SPORT_PRIORITY: [&str; 7] = [
    "Basketball",
    "Football",
    "Baseball",
    "Hockey",
    "Soccer",
    "College Football",
    "College Basketball",
];

pub fn priority_rank(sport: &str) -> usize {
    SPORT_PRIORITY
        .iter()
        .position(|s| s.eq_ignore_ascii_case(sport))
        .unwrap_or(SPORT_PRIORITY.len())
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct OrphanedTeam {
    pub id: i64,
    pub sport_id: i64,
    pub name: String,
    pub market: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SportOrphanCount {
    pub sport: String,
    pub total_teams: i64,
    pub orphaned: i64,
}

pub(crate) async fn require_memberships_table(pool: &SqlitePool) -> Result<()> {
    if !SchemaIntrospector::table_exists(pool, "team_league_memberships").await? {
        return Err(Error::PreconditionFailed(
            "team_league_memberships does not exist; run migration 0002_team_league_memberships first"
                .to_string(),
        ));
    }
    Ok(())
}

/// Look a sport up by name or slug, case-insensitively
pub async fn find_sport(pool: &SqlitePool, sport: &str) -> Result<Sport> {
    sqlx::query_as(
        "SELECT id, name, slug, display_order, is_active FROM sports \
         WHERE LOWER(name) = LOWER(?) OR LOWER(slug) = LOWER(?)",
    )
    .bind(sport)
    .bind(sport)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("sport '{}'", sport)))
}

/// Teams of `sport` without an active membership, by id
pub async fn detect_orphans(pool: &SqlitePool, sport: &str) -> Result<Vec<OrphanedTeam>> {
    require_memberships_table(pool).await?;
    let sport = find_sport(pool, sport).await?;
    orphans_for_sport(pool, sport.id).await
}

pub(crate) async fn orphans_for_sport<'e, E>(executor: E, sport_id: i64) -> Result<Vec<OrphanedTeam>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let orphans = sqlx::query_as(
        r#"
        SELECT t.id, t.sport_id, t.name, t.market, t.display_name
        FROM teams t
        LEFT JOIN team_league_memberships m ON m.team_id = t.id AND m.is_active = 1
        WHERE t.sport_id = ? AND m.id IS NULL
        ORDER BY t.id
        "#,
    )
    .bind(sport_id)
    .fetch_all(executor)
    .await?;

    Ok(orphans)
}

/// Per-sport team and orphan counts, in repair priority order
pub async fn orphan_summary(pool: &SqlitePool) -> Result<Vec<SportOrphanCount>> {
    require_memberships_table(pool).await?;

    let mut counts: Vec<SportOrphanCount> = sqlx::query_as(
        r#"
        SELECT s.name AS sport,
               COUNT(t.id) AS total_teams,
               COALESCE(SUM(CASE WHEN t.id IS NOT NULL AND NOT EXISTS (
                   SELECT 1 FROM team_league_memberships m
                   WHERE m.team_id = t.id AND m.is_active = 1
               ) THEN 1 ELSE 0 END), 0) AS orphaned
        FROM sports s
        LEFT JOIN teams t ON t.sport_id = s.id
        GROUP BY s.id, s.name
        "#,
    )
    .fetch_all(pool)
    .await?;

    counts.sort_by(|a, b| {
        priority_rank(&a.sport)
            .cmp(&priority_rank(&b.sport))
            .then_with(|| a.sport.cmp(&b.sport))
    });
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::seeded_pool;

    #[test]
    fn test_priority_rank() {
        assert_eq!(priority_rank("Basketball"), 0);
        assert_eq!(priority_rank("college basketball"), 6);
        assert_eq!(priority_rank("Curling"), SPORT_PRIORITY.len());
    }

    #[tokio::test]
    async fn test_detect_orphans() {
        let pool = seeded_pool().await;

        let orphans = detect_orphans(&pool, "basketball").await.unwrap();
        let names: Vec<&str> = orphans.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Celtics", "Knicks"]);

        // Inactive memberships do not count
        sqlx::query("UPDATE team_league_memberships SET is_active = 0 WHERE team_id = 1")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(detect_orphans(&pool, "Basketball").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_sport() {
        let pool = seeded_pool().await;
        assert!(matches!(
            detect_orphans(&pool, "Curling").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_orphan_summary_order() {
        let pool = seeded_pool().await;

        let summary = orphan_summary(&pool).await.unwrap();
        let sports: Vec<&str> = summary.iter().map(|s| s.sport.as_str()).collect();
        assert_eq!(sports, vec!["Basketball", "Hockey", "College Football", "Lacrosse"]);

        assert_eq!(summary[0].total_teams, 3);
        assert_eq!(summary[0].orphaned, 2);
        assert_eq!(summary[3].total_teams, 0);
        assert_eq!(summary[3].orphaned, 0);
    }
}
