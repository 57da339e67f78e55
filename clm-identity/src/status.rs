//! Per-user identity migration state
//!
//! ```text
//! unmigrated ──phase 2──> pending ──phase 3 index──> validated ──legacy column dropped──> finalized
//! ```
//!
//! A row is `Unmigrated` until it has a non-empty `firebase_uid`. It stays
//! `Pending` while nothing guarantees the uid is unique, becomes `Validated`
//! once a unique index covers the uid, and is `Finalized` when the legacy
//! column no longer exists.

use crate::phase3::unique_uid_index;
use clm_common::db::SchemaIntrospector;
use clm_common::Result;
use serde::Serialize;
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityState {
    Unmigrated,
    Pending,
    Validated,
    Finalized,
}

impl IdentityState {
    pub fn classify(has_uid: bool, uid_unique: bool, legacy_present: bool) -> Self {
        if !has_uid {
            IdentityState::Unmigrated
        } else if !legacy_present {
            IdentityState::Finalized
        } else if uid_unique {
            IdentityState::Validated
        } else {
            IdentityState::Pending
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IdentityStatus {
    pub total_users: i64,
    pub unmigrated: i64,
    pub pending: i64,
    pub validated: i64,
    pub finalized: i64,
    pub firebase_column_present: bool,
    pub legacy_column_present: bool,
    pub uid_unique_index_present: bool,
}

impl IdentityStatus {
    pub fn count(&self, state: IdentityState) -> i64 {
        match state {
            IdentityState::Unmigrated => self.unmigrated,
            IdentityState::Pending => self.pending,
            IdentityState::Validated => self.validated,
            IdentityState::Finalized => self.finalized,
        }
    }

    /// Next operator action
    pub fn next_step(&self) -> &'static str {
        if !self.firebase_column_present {
            "run phase1"
        } else if self.unmigrated > 0 {
            "run phase2"
        } else if self.legacy_column_present || !self.uid_unique_index_present {
            "run phase3"
        } else {
            "done"
        }
    }

    pub fn render(&self) -> String {
        format!(
            "Identity status ({} users)\n  unmigrated: {}\n  pending:    {}\n  validated:  {}\n  finalized:  {}\n\
             Schema: firebase_uid {}, clerk_user_id {}, uid unique index {}\nNext: {}\n",
            self.total_users,
            self.unmigrated,
            self.pending,
            self.validated,
            self.finalized,
            if self.firebase_column_present { "present" } else { "missing" },
            if self.legacy_column_present { "present" } else { "dropped" },
            if self.uid_unique_index_present { "present" } else { "missing" },
            self.next_step()
        )
    }
}

/// Count users per identity state
pub async fn identity_status(pool: &SqlitePool) -> Result<IdentityStatus> {
    let mut status = IdentityStatus {
        firebase_column_present: SchemaIntrospector::column_exists(pool, "users", "firebase_uid").await?,
        legacy_column_present: SchemaIntrospector::column_exists(pool, "users", "clerk_user_id").await?,
        ..Default::default()
    };
    let indexes = SchemaIntrospector::index_list_pool(pool, "users").await?;
    status.uid_unique_index_present = unique_uid_index(&indexes).is_some();

    status.total_users = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await?;

    let with_uid: i64 = if status.firebase_column_present {
        sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE firebase_uid IS NOT NULL AND firebase_uid <> ''")
            .fetch_one(pool)
            .await?
    } else {
        0
    };

    status.unmigrated = status.total_users - with_uid;
    let migrated_state = IdentityState::classify(
        true,
        status.uid_unique_index_present,
        status.legacy_column_present,
    );
    match migrated_state {
        IdentityState::Pending => status.pending = with_uid,
        IdentityState::Validated => status.validated = with_uid,
        IdentityState::Finalized => status.finalized = with_uid,
        IdentityState::Unmigrated => status.unmigrated += with_uid,
    }

    Ok(status)
}
