//! Database models
//!
//! Every query result the pipelines consume is decoded into one of these
//! named records.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Sport {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub display_order: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct League {
    pub id: i64,
    pub sport_id: i64,
    pub name: String,
    pub slug: String,
    pub competition_type: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Team {
    pub id: i64,
    pub sport_id: i64,
    pub name: String,
    pub market: Option<String>,
    pub display_name: Option<String>,
    pub abbreviation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeagueMembership {
    pub id: i64,
    pub team_id: i64,
    pub league_id: i64,
    pub season_start_year: i64,
    pub is_active: bool,
}

/// User identity record
///
/// Identity columns are optional because which of them exists depends on
/// how far the identity migration has progressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    #[sqlx(default)]
    pub clerk_user_id: Option<String>,
    #[sqlx(default)]
    pub firebase_uid: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
}

/// A value shared by more than one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DuplicateValue {
    pub value: String,
    pub occurrences: i64,
    /// Comma-separated ids of the rows sharing the value
    pub row_ids: String,
}

impl DuplicateValue {
    pub fn ids(&self) -> Vec<i64> {
        self.row_ids
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MigrationLogEntry {
    pub id: i64,
    pub migration_name: String,
    pub run_id: String,
    pub status: String,
    pub rows_affected: i64,
    pub error_message: Option<String>,
    pub created_at: chrono::NaiveDateTime,
}
