//! Maintenance database opening and the base migration chain

use clm_common::db::{
    open_maintenance_pool, InitialSchema, MigrationRunner, MigrationStep, SchemaIntrospector,
    TeamLeagueMemberships,
};

fn base_chain() -> MigrationRunner {
    let steps: Vec<Box<dyn MigrationStep>> = vec![
        Box::new(InitialSchema),
        Box::new(TeamLeagueMemberships {
            season_start_year: 2024,
        }),
    ];
    MigrationRunner::new(steps).unwrap()
}

#[tokio::test]
async fn test_database_creation_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("clm.db");

    let pool = open_maintenance_pool(&db_path).await.unwrap();
    assert!(db_path.exists(), "database file was not created");

    let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(foreign_keys, 1);
}

#[tokio::test]
async fn test_database_opens_existing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("clm.db");

    let pool = open_maintenance_pool(&db_path).await.unwrap();
    base_chain().upgrade(&pool, None).await.unwrap();
    pool.close().await;

    let reopened = open_maintenance_pool(&db_path).await.unwrap();
    assert_eq!(
        base_chain().current(&reopened).await.unwrap().as_deref(),
        Some("0002_team_league_memberships")
    );
    assert!(base_chain().pending(&reopened).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_membership_backfill_leaves_leagueless_teams_orphaned() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_maintenance_pool(&dir.path().join("clm.db")).await.unwrap();
    let runner = base_chain();

    runner.upgrade(&pool, Some("0001_initial_schema")).await.unwrap();
    for statement in [
        "INSERT INTO sports (id, name, slug) VALUES (1, 'Hockey', 'hockey')",
        "INSERT INTO leagues (id, sport_id, name, slug) VALUES (1, 1, 'National Hockey League', 'nhl')",
        "INSERT INTO teams (id, sport_id, league_id, name) VALUES (1, 1, 1, 'Bruins'), (2, 1, NULL, 'Kraken')",
    ] {
        sqlx::query(statement).execute(&pool).await.unwrap();
    }

    runner.upgrade(&pool, None).await.unwrap();
    let memberships: Vec<(i64, i64, i64)> = sqlx::query_as(
        "SELECT team_id, league_id, season_start_year FROM team_league_memberships",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(memberships, vec![(1, 1, 2024)]);

    // Reverting drops the join table but keeps teams.league_id
    runner.downgrade(&pool, Some("0001_initial_schema")).await.unwrap();
    assert!(!SchemaIntrospector::table_exists(&pool, "team_league_memberships")
        .await
        .unwrap());
    assert!(SchemaIntrospector::column_exists(&pool, "teams", "league_id")
        .await
        .unwrap());
}
