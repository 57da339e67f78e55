//! Column-level schema reconciliation
//!
//! A [`TableSchema`] declares the columns a table should carry. The
//! introspector reads the live shape through the `pragma_*` table-valued
//! functions, [`SchemaDiff`] turns the two into a list of [`SchemaDrift`],
//! and [`SchemaSync`] repairs the one kind of drift SQLite can fix in place:
//! a missing column. Nullability, key and type drift need
//! [`crate::db::rebuild_table`].
//!
//! ```rust,ignore
//! struct UserProfile;
//!
//! impl TableSchema for UserProfile {
//!     fn table_name() -> &'static str { "users" }
//!     fn expected_columns() -> Vec<ColumnDefinition> {
//!         vec![
//!             ColumnDefinition::new("id", "INTEGER").primary_key(),
//!             ColumnDefinition::new("timezone", "TEXT").default("'UTC'"),
//!         ]
//!     }
//! }
//!
//! SchemaSync::sync_table::<UserProfile>(&pool).await?;
//! ```
//!
//! Read helpers are generic over the executor, so a phase can inspect the
//! schema through `&mut *tx` without leaving its transaction.

use crate::db::rebuild::quote_ident;
use crate::Result;
use sqlx::{Executor, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

/// Declared shape of one column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    /// Declared type as written in DDL, e.g. `TEXT` or `TIMESTAMP`
    pub sql_type: String,
    pub not_null: bool,
    pub primary_key: bool,
    pub unique: bool,
    /// Raw SQL literal, quotes included (`'free'`, `0`, `CURRENT_TIMESTAMP`)
    pub default_value: Option<String>,
}

impl ColumnDefinition {
    /// Nullable column with no key, uniqueness or default
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        ColumnDefinition {
            name: name.into(),
            sql_type: sql_type.into(),
            not_null: false,
            primary_key: false,
            unique: false,
            default_value: None,
        }
    }

    pub fn primary_key(self) -> Self {
        ColumnDefinition { primary_key: true, ..self }
    }

    pub fn not_null(self) -> Self {
        ColumnDefinition { not_null: true, ..self }
    }

    pub fn unique(self) -> Self {
        ColumnDefinition { unique: true, ..self }
    }

    pub fn default(self, literal: impl Into<String>) -> Self {
        ColumnDefinition {
            default_value: Some(literal.into()),
            ..self
        }
    }

    /// Column clause accepted by `ALTER TABLE ADD COLUMN`.
    ///
    /// SQLite refuses PRIMARY KEY and UNIQUE there, and NOT NULL without a
    /// default; those are left out and reported by the caller.
    fn add_column_clause(&self) -> String {
        let mut clause = format!("{} {}", quote_ident(&self.name), self.sql_type);
        match (&self.default_value, self.not_null) {
            (Some(default), true) => clause.push_str(&format!(" NOT NULL DEFAULT {}", default)),
            (Some(default), false) => clause.push_str(&format!(" DEFAULT {}", default)),
            (None, _) => {}
        }
        clause
    }
}

/// One row of `pragma_table_info`
#[derive(Debug, Clone, PartialEq)]
pub struct ActualColumn {
    pub cid: i32,
    pub name: String,
    /// Declared type, empty when the DDL gave none
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    /// 1-based position within the primary key, 0 otherwise
    pub pk: i32,
}

impl ActualColumn {
    pub fn is_primary_key(&self) -> bool {
        self.pk > 0
    }
}

/// One row of `pragma_index_list` plus its key columns
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    /// `c` for CREATE INDEX, `u` for a UNIQUE constraint, `pk` for the key
    pub origin: String,
    pub partial: bool,
    pub columns: Vec<String>,
}

/// One column pair of `pragma_foreign_key_list`
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyInfo {
    /// Shared by every pair of a composite key
    pub id: i64,
    pub seq: i64,
    pub from_column: String,
    pub target_table: String,
    /// None when the key targets the parent's primary key implicitly
    pub target_column: Option<String>,
    pub on_update: String,
    pub on_delete: String,
}

/// A difference between a declared and a live column
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaDrift {
    /// Repairable with `ALTER TABLE ADD COLUMN`
    MissingColumn {
        table: String,
        column: ColumnDefinition,
    },
    /// Storage classes differ; needs a rebuild
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        actual: String,
    },
    /// NOT NULL or PRIMARY KEY absent on the live column; needs a rebuild
    ConstraintMismatch {
        table: String,
        column: String,
        constraint: String,
    },
}

impl SchemaDrift {
    pub fn describe(&self) -> String {
        match self {
            SchemaDrift::MissingColumn { table, column } => {
                format!("{}.{} is missing ({})", table, column.name, column.sql_type)
            }
            SchemaDrift::TypeMismatch { table, column, expected, actual } => {
                format!("{}.{} has type '{}', expected '{}'", table, column, actual, expected)
            }
            SchemaDrift::ConstraintMismatch { table, column, constraint } => {
                format!("{}.{} lacks {}", table, column, constraint)
            }
        }
    }
}

/// A table whose columns are declared in code
pub trait TableSchema {
    fn table_name() -> &'static str;

    /// Declared columns, in creation order
    fn expected_columns() -> Vec<ColumnDefinition>;
}

/// Read-only access to the live schema
pub struct SchemaIntrospector;

impl SchemaIntrospector {
    /// Columns of `table_name` ordered by position; empty when the table is absent
    pub async fn introspect_table<'e, E>(executor: E, table_name: &str) -> Result<Vec<ActualColumn>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query(
            "SELECT cid, name, type, \"notnull\", dflt_value, pk \
             FROM pragma_table_info(?) ORDER BY cid",
        )
        .bind(table_name)
        .fetch_all(executor)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ActualColumn {
                cid: row.get("cid"),
                name: row.get("name"),
                type_name: row.get("type"),
                not_null: row.get::<i32, _>("notnull") != 0,
                default_value: row.get("dflt_value"),
                pk: row.get("pk"),
            })
            .collect())
    }

    pub async fn table_exists<'e, E>(executor: E, table_name: &str) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        Self::master_entry_exists(executor, "table", table_name).await
    }

    pub async fn index_exists<'e, E>(executor: E, index_name: &str) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        Self::master_entry_exists(executor, "index", index_name).await
    }

    async fn master_entry_exists<'e, E>(executor: E, kind: &str, name: &str) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ? AND name = ?)",
        )
        .bind(kind)
        .bind(name)
        .fetch_one(executor)
        .await?;
        Ok(found)
    }

    /// False for a missing table as well as a missing column
    pub async fn column_exists<'e, E>(executor: E, table_name: &str, column: &str) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let hits: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?",
        )
        .bind(table_name)
        .bind(column)
        .fetch_one(executor)
        .await?;
        Ok(hits > 0)
    }

    /// Stored CREATE TABLE text
    pub async fn table_sql<'e, E>(executor: E, table_name: &str) -> Result<Option<String>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql: Option<Option<String>> = sqlx::query_scalar(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table_name)
        .fetch_optional(executor)
        .await?;
        Ok(sql.flatten())
    }

    /// Indexes of a table, sorted by name, each with its key columns.
    ///
    /// Takes a connection because every index needs a second pragma query.
    pub async fn index_list(conn: &mut SqliteConnection, table_name: &str) -> Result<Vec<IndexInfo>> {
        let rows = sqlx::query(
            "SELECT name, \"unique\", origin, partial FROM pragma_index_list(?) ORDER BY name",
        )
        .bind(table_name)
        .fetch_all(&mut *conn)
        .await?;

        let mut indexes = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("name");
            // expression keys come back with a NULL name
            let key_columns: Vec<Option<String>> = sqlx::query_scalar(
                "SELECT name FROM pragma_index_info(?) ORDER BY seqno",
            )
            .bind(&name)
            .fetch_all(&mut *conn)
            .await?;

            indexes.push(IndexInfo {
                name,
                unique: row.get::<i32, _>("unique") != 0,
                origin: row.get("origin"),
                partial: row.get::<i32, _>("partial") != 0,
                columns: key_columns.into_iter().flatten().collect(),
            });
        }
        Ok(indexes)
    }

    pub async fn index_list_pool(pool: &SqlitePool, table_name: &str) -> Result<Vec<IndexInfo>> {
        let mut conn = pool.acquire().await?;
        Self::index_list(&mut conn, table_name).await
    }

    pub async fn foreign_keys<'e, E>(executor: E, table_name: &str) -> Result<Vec<ForeignKeyInfo>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query(
            "SELECT id, seq, \"table\", \"from\", \"to\", on_update, on_delete \
             FROM pragma_foreign_key_list(?) ORDER BY id, seq",
        )
        .bind(table_name)
        .fetch_all(executor)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ForeignKeyInfo {
                id: row.get("id"),
                seq: row.get("seq"),
                from_column: row.get("from"),
                target_table: row.get("table"),
                target_column: row.get("to"),
                on_update: row.get("on_update"),
                on_delete: row.get("on_delete"),
            })
            .collect())
    }
}

/// SQLite column affinity, derived from a declared type the way the engine does it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl Affinity {
    fn of(declared: &str) -> Self {
        let declared = declared.to_ascii_uppercase();
        let has = |needle: &str| declared.contains(needle);
        if has("INT") {
            Affinity::Integer
        } else if has("CHAR") || has("CLOB") || has("TEXT") {
            Affinity::Text
        } else if declared.is_empty() || has("BLOB") {
            Affinity::Blob
        } else if has("REAL") || has("FLOA") || has("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }
}

/// Declared-versus-live comparison
pub struct SchemaDiff;

impl SchemaDiff {
    /// Drift of `actual` against `expected`, in declaration order.
    ///
    /// Live columns that are not declared are ignored.
    pub fn compare(
        table_name: &str,
        expected: &[ColumnDefinition],
        actual: &[ActualColumn],
    ) -> Vec<SchemaDrift> {
        let constraint = |column: &str, what: &str| SchemaDrift::ConstraintMismatch {
            table: table_name.to_string(),
            column: column.to_string(),
            constraint: what.to_string(),
        };

        let mut drift = Vec::new();
        for declared in expected {
            let Some(live) = actual.iter().find(|c| c.name == declared.name) else {
                drift.push(SchemaDrift::MissingColumn {
                    table: table_name.to_string(),
                    column: declared.clone(),
                });
                continue;
            };

            if !Self::types_compatible(&declared.sql_type, &live.type_name) {
                drift.push(SchemaDrift::TypeMismatch {
                    table: table_name.to_string(),
                    column: declared.name.clone(),
                    expected: declared.sql_type.clone(),
                    actual: live.type_name.clone(),
                });
            }
            // a rowid alias reports notnull = 0 yet cannot hold NULL
            if declared.not_null && !live.not_null && !live.is_primary_key() {
                drift.push(constraint(&declared.name, "NOT NULL"));
            }
            if declared.primary_key && !live.is_primary_key() {
                drift.push(constraint(&declared.name, "PRIMARY KEY"));
            }
        }
        drift
    }

    fn types_compatible(expected: &str, actual: &str) -> bool {
        expected.eq_ignore_ascii_case(actual) || Affinity::of(expected) == Affinity::of(actual)
    }
}

/// In-place column repair
pub struct SchemaSync;

impl SchemaSync {
    /// Add every declared column the live table lacks.
    ///
    /// Returns how many columns were added. Other drift is logged and left
    /// alone. A missing table is not an error: its creating migration has
    /// simply not run yet.
    pub async fn sync_table<T: TableSchema>(pool: &SqlitePool) -> Result<usize> {
        Self::sync_columns(pool, T::table_name(), &T::expected_columns()).await
    }

    pub async fn sync_columns(
        pool: &SqlitePool,
        table_name: &str,
        expected: &[ColumnDefinition],
    ) -> Result<usize> {
        if !SchemaIntrospector::table_exists(pool, table_name).await? {
            warn!(table = table_name, "Table absent, column sync skipped");
            return Ok(0);
        }

        let live = SchemaIntrospector::introspect_table(pool, table_name).await?;
        let mut added = 0;
        for drift in SchemaDiff::compare(table_name, expected, &live) {
            match drift {
                SchemaDrift::MissingColumn { table, column } => {
                    if Self::add_column(pool, &table, &column).await? {
                        added += 1;
                    }
                }
                other => warn!("{} (needs a table rebuild)", other.describe()),
            }
        }

        if added == 0 {
            debug!(table = table_name, "Columns already in place");
        } else {
            info!(table = table_name, added, "Added missing columns");
        }
        Ok(added)
    }

    /// `ALTER TABLE ADD COLUMN`; false when the column was already there
    pub async fn add_column(
        pool: &SqlitePool,
        table: &str,
        column: &ColumnDefinition,
    ) -> Result<bool> {
        if column.primary_key || column.unique {
            warn!(
                "{}.{}: key and UNIQUE constraints cannot be added in place, column added without them",
                table, column.name
            );
        }
        if column.not_null && column.default_value.is_none() {
            warn!(
                "{}.{}: NOT NULL needs a default when added in place, column added nullable",
                table, column.name
            );
        }

        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table),
            column.add_column_clause()
        );
        match sqlx::query(&sql).execute(pool).await {
            Ok(_) => {
                info!("Added {}.{} {}", table, column.name, column.sql_type);
                Ok(true)
            }
            Err(sqlx::Error::Database(e)) if e.message().contains("duplicate column") => {
                debug!("{}.{} already present", table, column.name);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
