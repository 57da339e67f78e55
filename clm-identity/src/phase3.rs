//! Phase 3: identity safety validator and constraint application
//!
//! # Gate
//!
//! Pre-flight runs three checks before anything is mutated:
//! 1. no user without a Firebase uid (fatal)
//! 2. no Firebase uid shared by two users (fatal)
//! 3. no non-empty email shared by two users (always warned, then handled
//!    by the configured [`EmailConflictPolicy`])
//!
//! # Apply
//!
//! One transaction with foreign key enforcement off: legacy `clerk_user_id`
//! indexes are dropped, `users` is rebuilt with `firebase_uid NOT NULL` and
//! without `clerk_user_id`, then the uid unique index and the partial unique
//! email index are created. Every step checks current state first, so a
//! re-run after partial completion converges.
//!
//! # Final validation
//!
//! The resulting schema is re-read from the catalog and must show a
//! non-nullable uid with a unique index and no legacy column.

use async_trait::async_trait;
use clm_common::config::EmailConflictPolicy;
use clm_common::db::{
    quote_ident, rebuild_table, DuplicateValue, IndexInfo, MigrationStep, RebuildOutcome, RebuildSpec,
    SchemaIntrospector,
};
use clm_common::{CheckResult, Error, HealthReport, Result};
use sqlx::{Connection, SqliteConnection, SqlitePool};
use tracing::{error, info, warn};

pub const UID_UNIQUE_INDEX: &str = "uq_users_firebase_uid";
pub const EMAIL_UNIQUE_INDEX: &str = "ux_users_email_present";
pub const EMAIL_PRESENT_PREDICATE: &str = "email IS NOT NULL AND email <> ''";

/// Offending rows listed in error messages
const MAX_LISTED: usize = 10;

/// Pre-flight findings
#[derive(Debug, Clone, PartialEq)]
pub struct PreflightReport {
    pub missing_uid_ids: Vec<i64>,
    pub duplicate_uids: Vec<DuplicateValue>,
    pub duplicate_emails: Vec<DuplicateValue>,
}

impl PreflightReport {
    /// Fatal findings (checks 1 and 2)
    pub fn is_blocking(&self) -> bool {
        !self.missing_uid_ids.is_empty() || !self.duplicate_uids.is_empty()
    }

    pub fn health(&self) -> HealthReport {
        let mut report = HealthReport::new();
        report.push(CheckResult::from_count(
            "identity:missing_firebase_uid",
            "preflight",
            self.missing_uid_ids.len() as i64,
            true,
            "users without a firebase uid",
        ));
        report.push(CheckResult::from_count(
            "identity:duplicate_firebase_uid",
            "preflight",
            self.duplicate_uids.len() as i64,
            true,
            "firebase uids shared by several users",
        ));
        report.push(CheckResult::from_count(
            "identity:duplicate_email",
            "preflight",
            self.duplicate_emails.len() as i64,
            false,
            "emails shared by several users",
        ));
        report
    }

    /// Descriptive message for the fatal findings
    pub fn blocking_message(&self) -> String {
        let mut problems = Vec::new();
        if !self.missing_uid_ids.is_empty() {
            problems.push(format!(
                "{} user(s) have no firebase_uid (ids {}); rerun phase 2",
                self.missing_uid_ids.len(),
                list_ids(&self.missing_uid_ids)
            ));
        }
        if !self.duplicate_uids.is_empty() {
            problems.push(format!(
                "{} firebase_uid value(s) are shared: {}",
                self.duplicate_uids.len(),
                describe_duplicates(&self.duplicate_uids)
            ));
        }
        problems.join("; ")
    }
}

fn list_ids(ids: &[i64]) -> String {
    let shown: Vec<String> = ids.iter().take(MAX_LISTED).map(|id| id.to_string()).collect();
    if ids.len() > MAX_LISTED {
        format!("{}, ...", shown.join(", "))
    } else {
        shown.join(", ")
    }
}

fn describe_duplicates(duplicates: &[DuplicateValue]) -> String {
    duplicates
        .iter()
        .take(MAX_LISTED)
        .map(|d| format!("'{}' x{} (users {})", d.value, d.occurrences, d.row_ids))
        .collect::<Vec<_>>()
        .join(", ")
}

/// What constraint application did
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintOutcome {
    pub preflight: PreflightReport,
    pub emails_cleared: u64,
    pub dropped_legacy_indexes: Vec<String>,
    pub rebuild: Option<RebuildOutcome>,
    pub created_indexes: Vec<String>,
    pub validation: HealthReport,
}

/// Run the pre-flight checks without mutating anything
pub async fn run_preflight(pool: &SqlitePool) -> Result<PreflightReport> {
    let mut conn = pool.acquire().await?;
    preflight_on(&mut conn).await
}

async fn preflight_on(conn: &mut SqliteConnection) -> Result<PreflightReport> {
    if !SchemaIntrospector::column_exists(&mut *conn, "users", "firebase_uid").await? {
        return Err(Error::PreconditionFailed(
            "users.firebase_uid does not exist; run phase 1 first".to_string(),
        ));
    }

    let missing_uid_ids: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM users WHERE firebase_uid IS NULL OR firebase_uid = '' ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await?;

    let duplicate_uids: Vec<DuplicateValue> = sqlx::query_as(
        r#"
        SELECT firebase_uid AS value, COUNT(*) AS occurrences, GROUP_CONCAT(id) AS row_ids
        FROM users
        WHERE firebase_uid IS NOT NULL AND firebase_uid <> ''
        GROUP BY firebase_uid
        HAVING COUNT(*) > 1
        ORDER BY firebase_uid
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let duplicate_emails: Vec<DuplicateValue> = sqlx::query_as(
        r#"
        SELECT email AS value, COUNT(*) AS occurrences, GROUP_CONCAT(id) AS row_ids
        FROM users
        WHERE email IS NOT NULL AND email <> ''
        GROUP BY email
        HAVING COUNT(*) > 1
        ORDER BY email
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(PreflightReport {
        missing_uid_ids,
        duplicate_uids,
        duplicate_emails,
    })
}

/// Gate, apply and validate the final identity constraints
pub async fn apply_constraints(pool: &SqlitePool, policy: EmailConflictPolicy) -> Result<ConstraintOutcome> {
    let preflight = run_preflight(pool).await?;

    if preflight.is_blocking() {
        let message = preflight.blocking_message();
        error!("Phase 3 pre-flight failed, no constraint changed: {}", message);
        return Err(Error::PreconditionFailed(message));
    }

    if !preflight.duplicate_emails.is_empty() {
        warn!(
            "⚠ {} email value(s) are shared by several users: {}",
            preflight.duplicate_emails.len(),
            describe_duplicates(&preflight.duplicate_emails)
        );
        if policy == EmailConflictPolicy::Abort {
            return Err(Error::PreconditionFailed(format!(
                "{} duplicate email value(s) would break the unique email index; \
                 deduplicate them or rerun with the null-duplicates email policy",
                preflight.duplicate_emails.len()
            )));
        }
        warn!("⚠ Keeping each email on its lowest-id user and clearing it on the others");
    }

    let mut outcome = ConstraintOutcome {
        preflight,
        emails_cleared: 0,
        dropped_legacy_indexes: Vec::new(),
        rebuild: None,
        created_indexes: Vec::new(),
        validation: HealthReport::new(),
    };

    {
        let mut conn = pool.acquire().await?;
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await?;
        let applied = apply_in_transaction(&mut conn, &mut outcome).await;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut *conn)
            .await?;
        applied?;
    }

    outcome.validation = validate_final_schema(pool).await?;
    if !outcome.validation.is_compliant() {
        let failures: Vec<String> = outcome
            .validation
            .failures()
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect();
        error!("Phase 3 final validation failed: {}", failures.join("; "));
        return Err(Error::ValidationFailed(failures.join("; ")));
    }

    info!("✓ Phase 3 complete: firebase_uid is NOT NULL and unique, legacy column removed");
    Ok(outcome)
}

async fn apply_in_transaction(conn: &mut SqliteConnection, outcome: &mut ConstraintOutcome) -> Result<()> {
    let mut tx = conn.begin().await?;

    for duplicate in &outcome.preflight.duplicate_emails {
        let mut ids = duplicate.ids();
        ids.sort_unstable();
        for id in ids.iter().skip(1) {
            outcome.emails_cleared += sqlx::query("UPDATE users SET email = NULL WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
    }
    if outcome.emails_cleared > 0 {
        info!("  Cleared {} duplicate email(s)", outcome.emails_cleared);
    }

    let indexes = SchemaIntrospector::index_list(&mut tx, "users").await?;
    for index in indexes
        .iter()
        .filter(|i| i.origin == "c" && i.columns.iter().any(|c| c == "clerk_user_id"))
    {
        sqlx::query(&format!("DROP INDEX IF EXISTS {}", quote_ident(&index.name)))
            .execute(&mut *tx)
            .await?;
        info!("  Dropped legacy index {}", index.name);
        outcome.dropped_legacy_indexes.push(index.name.clone());
    }

    let columns = SchemaIntrospector::introspect_table(&mut *tx, "users").await?;
    let legacy_present = columns.iter().any(|c| c.name == "clerk_user_id");
    let uid_nullable = columns
        .iter()
        .find(|c| c.name == "firebase_uid")
        .map(|c| !c.not_null)
        .unwrap_or(true);

    if legacy_present || uid_nullable {
        let spec = RebuildSpec::new("users")
            .drop_column("clerk_user_id")
            .set_not_null("firebase_uid", true);
        outcome.rebuild = Some(rebuild_table(&mut tx, &spec).await?);
    } else {
        info!("  users already has NOT NULL firebase_uid and no legacy column");
    }

    let index_ddl = [
        (
            UID_UNIQUE_INDEX,
            format!("CREATE UNIQUE INDEX {} ON users(firebase_uid)", UID_UNIQUE_INDEX),
        ),
        (
            EMAIL_UNIQUE_INDEX,
            format!(
                "CREATE UNIQUE INDEX {} ON users(email) WHERE {}",
                EMAIL_UNIQUE_INDEX, EMAIL_PRESENT_PREDICATE
            ),
        ),
    ];
    for (name, ddl) in index_ddl {
        if SchemaIntrospector::index_exists(&mut *tx, name).await? {
            continue;
        }
        sqlx::query(&ddl).execute(&mut *tx).await?;
        info!("  ✓ Created unique index {}", name);
        outcome.created_indexes.push(name.to_string());
    }

    let violations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pragma_foreign_key_check")
        .fetch_one(&mut *tx)
        .await?;
    if violations > 0 {
        tx.rollback().await?;
        return Err(Error::ValidationFailed(format!(
            "rebuilt users table leaves {} foreign key violation(s)",
            violations
        )));
    }

    tx.commit().await?;
    Ok(())
}

/// Unique, non-partial index on exactly `firebase_uid`
pub fn unique_uid_index(indexes: &[IndexInfo]) -> Option<&IndexInfo> {
    indexes
        .iter()
        .find(|i| i.unique && !i.partial && i.columns == ["firebase_uid"])
}

/// Post-flight catalog checks on the final users schema
pub async fn validate_final_schema(pool: &SqlitePool) -> Result<HealthReport> {
    let mut report = HealthReport::new();
    let category = "postflight";

    let columns = SchemaIntrospector::introspect_table(pool, "users").await?;
    match columns.iter().find(|c| c.name == "firebase_uid") {
        Some(column) if column.not_null => {
            report.push(CheckResult::pass("users.firebase_uid:not_null", category, "NOT NULL"));
        }
        Some(_) => {
            report.push(CheckResult::fail("users.firebase_uid:not_null", category, "column is nullable"));
        }
        None => {
            report.push(CheckResult::fail("users.firebase_uid:not_null", category, "column is missing"));
        }
    }

    if columns.iter().any(|c| c.name == "clerk_user_id") {
        report.push(CheckResult::fail("users.clerk_user_id:removed", category, "legacy column still present"));
    } else {
        report.push(CheckResult::pass("users.clerk_user_id:removed", category, "legacy column removed"));
    }

    let indexes = SchemaIntrospector::index_list_pool(pool, "users").await?;
    let unique_uid_count = indexes
        .iter()
        .filter(|i| i.unique && i.columns == ["firebase_uid"])
        .count() as i64;
    report.push(match unique_uid_index(&indexes) {
        Some(index) => CheckResult::pass("users.firebase_uid:unique", category, index.name.clone())
            .with_count(unique_uid_count),
        None => CheckResult::fail("users.firebase_uid:unique", category, "no unique index").with_count(0),
    });

    let email_index = indexes
        .iter()
        .find(|i| i.unique && i.partial && i.columns == ["email"]);
    report.push(match email_index {
        Some(index) => CheckResult::pass("users.email:unique_when_present", category, index.name.clone()),
        None => CheckResult::fail("users.email:unique_when_present", category, "no partial unique index on email"),
    });

    Ok(report)
}

/// `0004_firebase_identity_constraints`
pub struct FirebaseIdentityConstraints {
    pub email_policy: EmailConflictPolicy,
}

#[async_trait]
impl MigrationStep for FirebaseIdentityConstraints {
    fn id(&self) -> &'static str {
        "0004_firebase_identity_constraints"
    }

    fn predecessor(&self) -> Option<&'static str> {
        Some("0003_firebase_identity_columns")
    }

    fn description(&self) -> &'static str {
        "Enforce NOT NULL + UNIQUE firebase_uid, unique present emails, drop clerk_user_id"
    }

    async fn up(&self, pool: &SqlitePool) -> Result<()> {
        apply_constraints(pool, self.email_policy).await.map(|_| ())
    }

    /// Constraint removal only; the legacy column is not restored
    async fn down(&self, pool: &SqlitePool) -> Result<()> {
        let report = crate::rollback::rollback_constraints(pool).await;
        if report.has_failures() {
            warn!("Constraint rollback finished with failures:\n{}", report.render());
        }
        Ok(())
    }
}
