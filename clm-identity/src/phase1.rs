//! Phase 1: identity schema mutator
//!
//! Adds the nullable, non-unique `firebase_uid` column and the profile
//! enrichment columns to `users`, plus their lookup indexes. Moves no data
//! and leaves the legacy `clerk_user_id` untouched. Safe to re-run.

use async_trait::async_trait;
use clm_common::db::{
    quote_ident, MigrationStep, SchemaIntrospector, SchemaSync, TableSchema, UsersTableSchema,
};
use clm_common::{Error, Result};
use sqlx::SqlitePool;
use tracing::info;

/// Lookup indexes created by Phase 1: (name, column)
pub const PHASE1_INDEXES: [(&str, &str); 2] = [
    ("ix_users_firebase_uid", "firebase_uid"),
    ("ix_users_email", "email"),
];

/// Columns introduced by Phase 1, in creation order
pub const PHASE1_COLUMNS: [&str; 9] = [
    "firebase_uid",
    "photo_url",
    "bio",
    "timezone",
    "email_verified",
    "phone_number",
    "phone_verified",
    "auth_provider",
    "last_sign_in_at",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Phase1Outcome {
    pub columns_added: usize,
    pub indexes_created: Vec<String>,
}

impl Phase1Outcome {
    pub fn is_noop(&self) -> bool {
        self.columns_added == 0 && self.indexes_created.is_empty()
    }
}

/// Bring `users` up to the Phase 1 shape
pub async fn apply_identity_columns(pool: &SqlitePool) -> Result<Phase1Outcome> {
    let table = UsersTableSchema::table_name();
    if !SchemaIntrospector::table_exists(pool, table).await? {
        return Err(Error::NotFound(format!("table '{}'", table)));
    }

    let columns_added = SchemaSync::sync_table::<UsersTableSchema>(pool).await?;

    let mut indexes_created = Vec::new();
    for (index, column) in PHASE1_INDEXES {
        if SchemaIntrospector::index_exists(pool, index).await? {
            continue;
        }
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}({})",
            quote_ident(index),
            table,
            quote_ident(column)
        ))
        .execute(pool)
        .await?;
        info!("  ✓ Created index {}", index);
        indexes_created.push(index.to_string());
    }

    let outcome = Phase1Outcome {
        columns_added,
        indexes_created,
    };
    if outcome.is_noop() {
        info!("Phase 1: users already has the identity columns - nothing to do");
    } else {
        info!(
            "✓ Phase 1 complete: {} column(s), {} index(es) added",
            outcome.columns_added,
            outcome.indexes_created.len()
        );
    }

    Ok(outcome)
}

/// Remove everything Phase 1 added.
///
/// Refused once the legacy column is gone: the Firebase uid is then the
/// only identity left and dropping it would orphan every account.
pub async fn remove_identity_columns(pool: &SqlitePool) -> Result<usize> {
    if !SchemaIntrospector::column_exists(pool, "users", "clerk_user_id").await? {
        return Err(Error::PreconditionFailed(
            "users.clerk_user_id no longer exists; restore a snapshot instead of removing firebase_uid"
                .to_string(),
        ));
    }

    for (index, _) in PHASE1_INDEXES {
        sqlx::query(&format!("DROP INDEX IF EXISTS {}", quote_ident(index)))
            .execute(pool)
            .await?;
    }

    let mut removed = 0;
    for column in PHASE1_COLUMNS.iter().rev() {
        if SchemaIntrospector::column_exists(pool, "users", column).await? {
            sqlx::query(&format!("ALTER TABLE users DROP COLUMN {}", quote_ident(column)))
                .execute(pool)
                .await?;
            removed += 1;
        }
    }

    info!("✓ Removed {} Phase 1 column(s) from users", removed);
    Ok(removed)
}

/// `0003_firebase_identity_columns`
pub struct FirebaseIdentityColumns;

#[async_trait]
impl MigrationStep for FirebaseIdentityColumns {
    fn id(&self) -> &'static str {
        "0003_firebase_identity_columns"
    }

    fn predecessor(&self) -> Option<&'static str> {
        Some("0002_team_league_memberships")
    }

    fn description(&self) -> &'static str {
        "Add nullable users.firebase_uid and profile enrichment columns"
    }

    async fn up(&self, pool: &SqlitePool) -> Result<()> {
        apply_identity_columns(pool).await.map(|_| ())
    }

    async fn down(&self, pool: &SqlitePool) -> Result<()> {
        remove_identity_columns(pool).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clm_common::db::{create_base_schema, memory_pool};

    #[tokio::test]
    async fn test_phase1_adds_columns_and_indexes() {
        let pool = memory_pool().await.unwrap();
        create_base_schema(&pool).await.unwrap();

        let outcome = apply_identity_columns(&pool).await.unwrap();
        assert_eq!(outcome.columns_added, PHASE1_COLUMNS.len());
        assert_eq!(outcome.indexes_created.len(), 2);

        let columns = SchemaIntrospector::introspect_table(&pool, "users").await.unwrap();
        let firebase = columns.iter().find(|c| c.name == "firebase_uid").unwrap();
        assert!(!firebase.not_null);
        let verified = columns.iter().find(|c| c.name == "email_verified").unwrap();
        assert!(verified.not_null);
        assert_eq!(verified.default_value.as_deref(), Some("0"));

        // Legacy column untouched, new uid index is not unique
        assert!(columns.iter().any(|c| c.name == "clerk_user_id"));
        let indexes = SchemaIntrospector::index_list_pool(&pool, "users").await.unwrap();
        let uid_index = indexes.iter().find(|i| i.name == "ix_users_firebase_uid").unwrap();
        assert!(!uid_index.unique);
    }

    #[tokio::test]
    async fn test_phase1_rerun_is_noop() {
        let pool = memory_pool().await.unwrap();
        create_base_schema(&pool).await.unwrap();

        apply_identity_columns(&pool).await.unwrap();
        let second = apply_identity_columns(&pool).await.unwrap();

        assert!(second.is_noop());
    }

    #[tokio::test]
    async fn test_phase1_requires_users_table() {
        let pool = memory_pool().await.unwrap();
        assert!(matches!(
            apply_identity_columns(&pool).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_identity_columns() {
        let pool = memory_pool().await.unwrap();
        create_base_schema(&pool).await.unwrap();
        apply_identity_columns(&pool).await.unwrap();

        let removed = remove_identity_columns(&pool).await.unwrap();
        assert_eq!(removed, PHASE1_COLUMNS.len());
        assert!(!SchemaIntrospector::column_exists(&pool, "users", "firebase_uid").await.unwrap());
        assert!(!SchemaIntrospector::index_exists(&pool, "ix_users_email").await.unwrap());
    }
}
