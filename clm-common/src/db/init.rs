//! Database connections and the base schema
//!
//! Maintenance scripts hold exactly one connection for their whole run, so
//! every pool opened here is capped at a single connection. Callers must not
//! hold a transaction while issuing queries against the pool itself.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Open (creating if needed) the database file used by a maintenance run
pub async fn open_maintenance_pool(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;

    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    Ok(pool)
}

/// Single-connection in-memory database (tests and dry experiments)
pub async fn memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;

    Ok(pool)
}

/// Create every base table in its pre-migration shape.
///
/// Users still carry the legacy `clerk_user_id`, teams still carry the legacy
/// single `league_id`. Idempotent.
pub async fn create_base_schema(pool: &SqlitePool) -> Result<()> {
    create_sports_table(pool).await?;
    create_leagues_table(pool).await?;
    create_teams_table(pool).await?;
    create_users_table(pool).await?;
    create_user_sport_preferences_table(pool).await?;
    create_user_team_preferences_table(pool).await?;
    create_migration_log_table(pool).await?;
    Ok(())
}

/// Drop every base table (reverse dependency order)
pub async fn drop_base_schema(pool: &SqlitePool) -> Result<()> {
    for table in [
        "migration_log",
        "user_team_preferences",
        "user_sport_preferences",
        "users",
        "teams",
        "leagues",
        "sports",
    ] {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(pool)
            .await?;
    }
    Ok(())
}

async fn create_sports_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            slug TEXT NOT NULL UNIQUE,
            display_order INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_leagues_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS leagues (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sport_id INTEGER NOT NULL REFERENCES sports(id),
            name TEXT NOT NULL,
            slug TEXT NOT NULL UNIQUE,
            abbreviation TEXT,
            competition_type TEXT NOT NULL DEFAULT 'league'
                CHECK (competition_type IN ('league', 'conference', 'division', 'tournament')),
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS ix_leagues_sport_id ON leagues(sport_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_teams_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS teams (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sport_id INTEGER NOT NULL REFERENCES sports(id),
            league_id INTEGER REFERENCES leagues(id),
            name TEXT NOT NULL,
            market TEXT,
            display_name TEXT,
            abbreviation TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS ix_teams_sport_id ON teams(sport_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_users_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            clerk_user_id TEXT UNIQUE,
            email TEXT,
            first_name TEXT,
            last_name TEXT,
            display_name TEXT,
            onboarding_completed INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_user_sport_preferences_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_sport_preferences (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            sport_id INTEGER NOT NULL REFERENCES sports(id),
            rank INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (user_id, sport_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_user_team_preferences_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_team_preferences (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            team_id INTEGER NOT NULL REFERENCES teams(id),
            affinity_score REAL NOT NULL DEFAULT 0.5,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (user_id, team_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the migration_log table
///
/// Optional sink; writers tolerate its absence.
pub async fn create_migration_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS migration_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            migration_name TEXT NOT NULL,
            run_id TEXT NOT NULL,
            status TEXT NOT NULL,
            rows_affected INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the team_league_memberships join table and its indexes
pub async fn create_team_league_memberships_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS team_league_memberships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            team_id INTEGER NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
            league_id INTEGER NOT NULL REFERENCES leagues(id),
            season_start_year INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (team_id, league_id, season_start_year)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_team_league_memberships_team_active \
         ON team_league_memberships(team_id, is_active)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_team_league_memberships_league \
         ON team_league_memberships(league_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema_sync::SchemaIntrospector;

    #[tokio::test]
    async fn test_create_base_schema_idempotent() {
        let pool = memory_pool().await.unwrap();

        create_base_schema(&pool).await.unwrap();
        create_base_schema(&pool).await.unwrap();

        for table in ["sports", "leagues", "teams", "users", "migration_log"] {
            assert!(
                SchemaIntrospector::table_exists(&pool, table).await.unwrap(),
                "missing table {}",
                table
            );
        }
        assert!(!SchemaIntrospector::table_exists(&pool, "team_league_memberships")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_drop_base_schema() {
        let pool = memory_pool().await.unwrap();
        create_base_schema(&pool).await.unwrap();
        drop_base_schema(&pool).await.unwrap();

        assert!(!SchemaIntrospector::table_exists(&pool, "users").await.unwrap());
        assert!(!SchemaIntrospector::table_exists(&pool, "sports").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_maintenance_pool_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("clm.db");

        let pool = open_maintenance_pool(&db_path).await.unwrap();
        create_base_schema(&pool).await.unwrap();

        assert!(db_path.exists());

        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fk, 1);
    }
}
