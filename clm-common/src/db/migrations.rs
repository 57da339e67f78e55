//! Ordered schema migrations
//!
//! Migrations are explicit step descriptors chained by predecessor id and
//! handed to a [`MigrationRunner`]. Ordering never depends on module load
//! order: the runner validates the chain up front and records applied steps
//! in the `schema_migrations` table.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing steps** - databases in the field were built by them
//! 2. **Always append new steps** - the new step's predecessor is the current head
//! 3. **Make `up` idempotent** - check for columns/tables before adding them
//! 4. **Document one-way steps** - if `down` cannot restore data, say so
//!
//! # Example Step
//!
//! ```rust,ignore
//! struct AddTimezone;
//!
//! #[async_trait]
//! impl MigrationStep for AddTimezone {
//!     fn id(&self) -> &'static str { "0005_add_timezone" }
//!     fn predecessor(&self) -> Option<&'static str> { Some("0004_firebase_identity_constraints") }
//!     fn description(&self) -> &'static str { "Add users.timezone" }
//!
//!     async fn up(&self, pool: &SqlitePool) -> Result<()> {
//!         SchemaSync::add_column(pool, "users", &ColumnDefinition::new("timezone", "TEXT")).await?;
//!         Ok(())
//!     }
//!
//!     async fn down(&self, _pool: &SqlitePool) -> Result<()> { Ok(()) }
//! }
//! ```

use crate::db::init::{create_base_schema, create_team_league_memberships_table, drop_base_schema};
use crate::db::schema_sync::SchemaIntrospector;
use crate::{Error, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::HashSet;
use tracing::{info, warn};

/// One step of the migration chain
#[async_trait]
pub trait MigrationStep: Send + Sync {
    /// Unique, stable identifier
    fn id(&self) -> &'static str;

    /// Id of the step this one builds on (`None` for the root)
    fn predecessor(&self) -> Option<&'static str>;

    fn description(&self) -> &'static str;

    /// Forward transformation
    async fn up(&self, pool: &SqlitePool) -> Result<()>;

    /// Backward transformation
    async fn down(&self, pool: &SqlitePool) -> Result<()>;
}

/// Row of the `schema_migrations` table
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AppliedMigration {
    pub id: String,
    pub applied_at: chrono::NaiveDateTime,
}

/// Applies and reverts a validated chain of [`MigrationStep`]s
pub struct MigrationRunner {
    steps: Vec<Box<dyn MigrationStep>>,
}

impl std::fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("steps", &self.ids())
            .finish()
    }
}

impl MigrationRunner {
    /// Build a runner, rejecting broken chains.
    ///
    /// The chain must start with the only root step and every subsequent
    /// step must name its immediate predecessor.
    pub fn new(steps: Vec<Box<dyn MigrationStep>>) -> Result<Self> {
        if steps.is_empty() {
            return Err(Error::InvalidInput("migration chain is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for (position, step) in steps.iter().enumerate() {
            if !seen.insert(step.id()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate migration id '{}'",
                    step.id()
                )));
            }

            let expected = if position == 0 {
                None
            } else {
                Some(steps[position - 1].id())
            };

            if step.predecessor() != expected {
                return Err(Error::InvalidInput(format!(
                    "migration '{}' declares predecessor {:?}, expected {:?}",
                    step.id(),
                    step.predecessor(),
                    expected
                )));
            }
        }

        Ok(Self { steps })
    }

    /// Step ids in chain order
    pub fn ids(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.id()).collect()
    }

    pub fn head(&self) -> &'static str {
        self.steps[self.steps.len() - 1].id()
    }

    fn position(&self, id: &str) -> Result<usize> {
        self.steps
            .iter()
            .position(|s| s.id() == id)
            .ok_or_else(|| Error::NotFound(format!("migration '{}'", id)))
    }

    async fn ensure_tracking_table(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                id TEXT PRIMARY KEY,
                applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Applied steps in chain order.
    ///
    /// Errors when the database records a step this chain does not know or
    /// when the applied set is not a prefix of the chain.
    pub async fn applied(&self, pool: &SqlitePool) -> Result<Vec<AppliedMigration>> {
        if !SchemaIntrospector::table_exists(pool, "schema_migrations").await? {
            return Ok(Vec::new());
        }

        let rows: Vec<AppliedMigration> =
            sqlx::query_as("SELECT id, applied_at FROM schema_migrations")
                .fetch_all(pool)
                .await?;

        let mut ordered = Vec::with_capacity(rows.len());
        for step in &self.steps {
            if let Some(row) = rows.iter().find(|r| r.id == step.id()) {
                ordered.push(row.clone());
            }
        }

        if let Some(unknown) = rows.iter().find(|r| self.position(&r.id).is_err()) {
            return Err(Error::InvalidInput(format!(
                "database records migration '{}' which is not part of this chain",
                unknown.id
            )));
        }

        for (position, row) in ordered.iter().enumerate() {
            if self.steps[position].id() != row.id {
                return Err(Error::InvalidInput(format!(
                    "applied migrations are not a prefix of the chain (found '{}' at position {})",
                    row.id, position
                )));
            }
        }

        Ok(ordered)
    }

    /// Most recently applied step, if any
    pub async fn current(&self, pool: &SqlitePool) -> Result<Option<String>> {
        Ok(self.applied(pool).await?.pop().map(|m| m.id))
    }

    /// Steps not yet applied, in order
    pub async fn pending(&self, pool: &SqlitePool) -> Result<Vec<&'static str>> {
        let applied = self.applied(pool).await?.len();
        Ok(self.steps[applied..].iter().map(|s| s.id()).collect())
    }

    /// Apply pending steps in order, up to and including `target`
    /// (or the whole chain). Returns the ids applied by this call.
    pub async fn upgrade(&self, pool: &SqlitePool, target: Option<&str>) -> Result<Vec<&'static str>> {
        Self::ensure_tracking_table(pool).await?;

        let applied = self.applied(pool).await?.len();
        let end = match target {
            Some(id) => self.position(id)? + 1,
            None => self.steps.len(),
        };

        if applied >= end {
            info!("Database schema is up to date ({})", self.steps[end - 1].id());
            return Ok(Vec::new());
        }

        info!(
            "Running {} migration(s): {} -> {}",
            end - applied,
            if applied == 0 { "<empty>" } else { self.steps[applied - 1].id() },
            self.steps[end - 1].id()
        );

        let mut done = Vec::new();
        for step in &self.steps[applied..end] {
            info!("Running migration {}: {}", step.id(), step.description());
            step.up(pool).await?;

            sqlx::query("INSERT INTO schema_migrations (id) VALUES (?)")
                .bind(step.id())
                .execute(pool)
                .await?;

            info!("✓ Migration {} completed", step.id());
            done.push(step.id());
        }

        Ok(done)
    }

    /// Revert applied steps newest-first until `target` is the head
    /// (`None` reverts everything). Returns the ids reverted by this call.
    pub async fn downgrade(&self, pool: &SqlitePool, target: Option<&str>) -> Result<Vec<&'static str>> {
        let applied = self.applied(pool).await?.len();
        let keep = match target {
            Some(id) => {
                let position = self.position(id)?;
                if position >= applied {
                    return Err(Error::InvalidInput(format!(
                        "cannot downgrade to '{}': it is not applied",
                        id
                    )));
                }
                position + 1
            }
            None => 0,
        };

        let mut done = Vec::new();
        for step in self.steps[keep..applied].iter().rev() {
            warn!("Reverting migration {}: {}", step.id(), step.description());
            step.down(pool).await?;

            sqlx::query("DELETE FROM schema_migrations WHERE id = ?")
                .bind(step.id())
                .execute(pool)
                .await?;

            info!("✓ Migration {} reverted", step.id());
            done.push(step.id());
        }

        Ok(done)
    }
}

/// Root step: sports/leagues/teams/users and preference tables
pub struct InitialSchema;

#[async_trait]
impl MigrationStep for InitialSchema {
    fn id(&self) -> &'static str {
        "0001_initial_schema"
    }

    fn predecessor(&self) -> Option<&'static str> {
        None
    }

    fn description(&self) -> &'static str {
        "Create sports, leagues, teams, users and onboarding preference tables"
    }

    async fn up(&self, pool: &SqlitePool) -> Result<()> {
        create_base_schema(pool).await
    }

    async fn down(&self, pool: &SqlitePool) -> Result<()> {
        drop_base_schema(pool).await
    }
}

/// Replace the single `teams.league_id` with a membership join table.
///
/// Existing `league_id` values are backfilled as active memberships for
/// `season_start_year`. Teams without a (valid) league end up orphaned and
/// are picked up by the repair tool.
pub struct TeamLeagueMemberships {
    pub season_start_year: i64,
}

#[async_trait]
impl MigrationStep for TeamLeagueMemberships {
    fn id(&self) -> &'static str {
        "0002_team_league_memberships"
    }

    fn predecessor(&self) -> Option<&'static str> {
        Some("0001_initial_schema")
    }

    fn description(&self) -> &'static str {
        "Create team_league_memberships and backfill from teams.league_id"
    }

    async fn up(&self, pool: &SqlitePool) -> Result<()> {
        create_team_league_memberships_table(pool).await?;

        let backfilled = sqlx::query(
            r#"
            INSERT INTO team_league_memberships (team_id, league_id, season_start_year, is_active)
            SELECT t.id, t.league_id, ?, 1
            FROM teams t
            WHERE t.league_id IS NOT NULL
              AND EXISTS (SELECT 1 FROM leagues l WHERE l.id = t.league_id)
              AND NOT EXISTS (
                  SELECT 1 FROM team_league_memberships m
                  WHERE m.team_id = t.id AND m.league_id = t.league_id
              )
            "#,
        )
        .bind(self.season_start_year)
        .execute(pool)
        .await?
        .rows_affected();

        info!("  ✓ Backfilled {} membership(s) from teams.league_id", backfilled);
        Ok(())
    }

    async fn down(&self, pool: &SqlitePool) -> Result<()> {
        // teams.league_id is never removed, so dropping the join table loses
        // only memberships created after the backfill
        sqlx::query("DROP TABLE IF EXISTS team_league_memberships")
            .execute(pool)
            .await?;
        Ok(())
    }
}
