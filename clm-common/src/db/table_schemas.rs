//! Table Schema Definitions
//!
//! Expected columns of the fully migrated schema, one struct per table.
//! The verifier compares these against the live database; the identity
//! migration uses [`UsersTableSchema`] as its Phase 1 target.

use crate::db::schema_sync::{ColumnDefinition, TableSchema};

pub struct SportsTableSchema;

impl TableSchema for SportsTableSchema {
    fn table_name() -> &'static str {
        "sports"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("name", "TEXT").not_null().unique(),
            ColumnDefinition::new("slug", "TEXT").not_null().unique(),
            ColumnDefinition::new("display_order", "INTEGER").not_null().default("0"),
            ColumnDefinition::new("is_active", "INTEGER").not_null().default("1"),
        ]
    }
}

pub struct LeaguesTableSchema;

impl TableSchema for LeaguesTableSchema {
    fn table_name() -> &'static str {
        "leagues"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("sport_id", "INTEGER").not_null(),
            ColumnDefinition::new("name", "TEXT").not_null(),
            ColumnDefinition::new("slug", "TEXT").not_null().unique(),
            ColumnDefinition::new("competition_type", "TEXT").not_null().default("'league'"),
            ColumnDefinition::new("is_active", "INTEGER").not_null().default("1"),
        ]
    }
}

pub struct TeamsTableSchema;

impl TableSchema for TeamsTableSchema {
    fn table_name() -> &'static str {
        "teams"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("sport_id", "INTEGER").not_null(),
            ColumnDefinition::new("name", "TEXT").not_null(),
            ColumnDefinition::new("market", "TEXT"),
            ColumnDefinition::new("display_name", "TEXT"),
        ]
    }
}

pub struct TeamLeagueMembershipsTableSchema;

impl TableSchema for TeamLeagueMembershipsTableSchema {
    fn table_name() -> &'static str {
        "team_league_memberships"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("team_id", "INTEGER").not_null(),
            ColumnDefinition::new("league_id", "INTEGER").not_null(),
            ColumnDefinition::new("season_start_year", "INTEGER").not_null(),
            ColumnDefinition::new("is_active", "INTEGER").not_null().default("1"),
        ]
    }
}

/// Users after Phase 1: the new identity column plus profile enrichment.
///
/// `firebase_uid` is declared nullable here; Phase 3 tightens it with a
/// table rebuild once every row is populated.
pub struct UsersTableSchema;

impl TableSchema for UsersTableSchema {
    fn table_name() -> &'static str {
        "users"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("firebase_uid", "TEXT"),
            ColumnDefinition::new("email", "TEXT"),
            ColumnDefinition::new("first_name", "TEXT"),
            ColumnDefinition::new("last_name", "TEXT"),
            ColumnDefinition::new("display_name", "TEXT"),
            ColumnDefinition::new("photo_url", "TEXT"),
            ColumnDefinition::new("bio", "TEXT"),
            ColumnDefinition::new("timezone", "TEXT"),
            ColumnDefinition::new("email_verified", "INTEGER").not_null().default("0"),
            ColumnDefinition::new("phone_number", "TEXT"),
            ColumnDefinition::new("phone_verified", "INTEGER").not_null().default("0"),
            ColumnDefinition::new("auth_provider", "TEXT"),
            ColumnDefinition::new("last_sign_in_at", "TIMESTAMP"),
        ]
    }
}

pub struct UserSportPreferencesTableSchema;

impl TableSchema for UserSportPreferencesTableSchema {
    fn table_name() -> &'static str {
        "user_sport_preferences"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("user_id", "INTEGER").not_null(),
            ColumnDefinition::new("sport_id", "INTEGER").not_null(),
            ColumnDefinition::new("rank", "INTEGER").not_null(),
        ]
    }
}

pub struct UserTeamPreferencesTableSchema;

impl TableSchema for UserTeamPreferencesTableSchema {
    fn table_name() -> &'static str {
        "user_team_preferences"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("user_id", "INTEGER").not_null(),
            ColumnDefinition::new("team_id", "INTEGER").not_null(),
            ColumnDefinition::new("affinity_score", "REAL").not_null(),
        ]
    }
}

/// Every declared table schema as (table, expected columns)
pub fn expected_table_schemas() -> Vec<(&'static str, Vec<ColumnDefinition>)> {
    fn entry<T: TableSchema>() -> (&'static str, Vec<ColumnDefinition>) {
        (T::table_name(), T::expected_columns())
    }

    vec![
        entry::<SportsTableSchema>(),
        entry::<LeaguesTableSchema>(),
        entry::<TeamsTableSchema>(),
        entry::<TeamLeagueMembershipsTableSchema>(),
        entry::<UsersTableSchema>(),
        entry::<UserSportPreferencesTableSchema>(),
        entry::<UserTeamPreferencesTableSchema>(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::{create_base_schema, memory_pool};
    use crate::db::schema_sync::{SchemaDiff, SchemaDrift, SchemaIntrospector};

    #[test]
    fn test_users_schema_definition() {
        let columns = UsersTableSchema::expected_columns();

        assert!(columns.iter().any(|c| c.name == "id" && c.primary_key));
        assert!(columns.iter().any(|c| c.name == "firebase_uid" && !c.not_null && !c.unique));
        assert!(!columns.iter().any(|c| c.name == "clerk_user_id"));
    }

    #[tokio::test]
    async fn test_base_schema_only_drifts_on_identity_columns() {
        let pool = memory_pool().await.unwrap();
        create_base_schema(&pool).await.unwrap();

        for (table, expected) in expected_table_schemas() {
            if table == "team_league_memberships" {
                continue;
            }
            let actual = SchemaIntrospector::introspect_table(&pool, table).await.unwrap();
            let drift = SchemaDiff::compare(table, &expected, &actual);

            if table == "users" {
                assert!(drift
                    .iter()
                    .all(|d| matches!(d, SchemaDrift::MissingColumn { .. })));
                assert!(drift.iter().any(
                    |d| matches!(d, SchemaDrift::MissingColumn { column, .. } if column.name == "firebase_uid")
                ));
            } else {
                assert!(drift.is_empty(), "unexpected drift on {}: {:?}", table, drift);
            }
        }
    }
}
