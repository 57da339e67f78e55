//! Table rebuild (SQLite's generalized ALTER TABLE procedure)
//!
//! SQLite cannot change a column's nullability or drop a column that backs a
//! UNIQUE constraint in place. The rebuild creates a replacement table from
//! the introspected definition with the requested changes applied, copies
//! every row, swaps the tables and re-creates surviving indexes and triggers.
//!
//! The caller owns the transaction and must have disabled foreign key
//! enforcement on the connection beforehand (`PRAGMA foreign_keys = OFF`
//! has no effect inside a transaction). Column collations are not in PRAGMA
//! output and are read back from the stored CREATE TABLE text. Tables
//! declaring CHECK constraints or generated columns are refused.

use crate::db::schema_sync::{ActualColumn, ForeignKeyInfo, IndexInfo, SchemaIntrospector};
use crate::{Error, Result};
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Requested changes for one rebuild
#[derive(Debug, Clone, Default)]
pub struct RebuildSpec {
    pub table: String,
    /// Columns to remove, together with any index/constraint using them
    pub drop_columns: Vec<String>,
    /// Nullability overrides: (column, not_null)
    pub nullability: Vec<(String, bool)>,
}

impl RebuildSpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn drop_column(mut self, column: impl Into<String>) -> Self {
        self.drop_columns.push(column.into());
        self
    }

    pub fn set_not_null(mut self, column: impl Into<String>, not_null: bool) -> Self {
        self.nullability.push((column.into(), not_null));
        self
    }

    fn is_dropped(&self, column: &str) -> bool {
        self.drop_columns.iter().any(|c| c == column)
    }

    fn not_null_override(&self, column: &str) -> Option<bool> {
        self.nullability
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, not_null)| *not_null)
    }
}

/// What a rebuild did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebuildOutcome {
    pub rows_copied: u64,
    pub dropped_columns: Vec<String>,
    pub recreated_indexes: Vec<String>,
    /// Indexes that referenced a dropped column
    pub discarded_indexes: Vec<String>,
}

/// Quote an SQL identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Rebuild `spec.table` applying the requested column changes.
///
/// Fails (leaving the caller's transaction to roll back) when copied data
/// violates a newly added NOT NULL.
pub async fn rebuild_table(conn: &mut SqliteConnection, spec: &RebuildSpec) -> Result<RebuildOutcome> {
    let table = spec.table.as_str();

    let table_sql = SchemaIntrospector::table_sql(&mut *conn, table)
        .await?
        .ok_or_else(|| Error::NotFound(format!("table '{}'", table)))?;

    let upper_sql = table_sql.to_uppercase();
    if upper_sql.contains("CHECK (") || upper_sql.contains("CHECK(") {
        return Err(Error::InvalidInput(format!(
            "table '{}' declares CHECK constraints and cannot be rebuilt automatically",
            table
        )));
    }

    let generated: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_xinfo(?) WHERE hidden IN (2, 3)",
    )
    .bind(table)
    .fetch_one(&mut *conn)
    .await?;
    if generated > 0 {
        return Err(Error::InvalidInput(format!(
            "table '{}' declares generated columns and cannot be rebuilt automatically",
            table
        )));
    }
    let collations = declared_collations(&table_sql);

    let columns = SchemaIntrospector::introspect_table(&mut *conn, table).await?;
    for dropped in &spec.drop_columns {
        if !columns.iter().any(|c| &c.name == dropped) {
            debug!("Rebuild of '{}': column '{}' already absent", table, dropped);
        }
    }
    let kept: Vec<&ActualColumn> = columns.iter().filter(|c| !spec.is_dropped(&c.name)).collect();
    if kept.is_empty() {
        return Err(Error::InvalidInput(format!(
            "rebuild of '{}' would leave no columns",
            table
        )));
    }

    let indexes = SchemaIntrospector::index_list(&mut *conn, table).await?;
    let foreign_keys = SchemaIntrospector::foreign_keys(&mut *conn, table).await?;

    // Explicit index and trigger definitions must be captured before the drop
    let explicit_sql: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT name, sql FROM sqlite_master WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;
    let trigger_sql: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT name, sql FROM sqlite_master WHERE type = 'trigger' AND tbl_name = ?",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    let autoincrement = upper_sql.contains("AUTOINCREMENT");
    let create_body =
        build_table_body(spec, &kept, &collations, &indexes, &foreign_keys, autoincrement);

    let temp_name = format!("{}__rebuild", table);
    let column_list = kept
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&temp_name)))
        .execute(&mut *conn)
        .await?;
    let create_sql = format!("CREATE TABLE {} (\n    {}\n)", quote_ident(&temp_name), create_body);
    debug!("Rebuild DDL: {}", create_sql);
    sqlx::query(&create_sql).execute(&mut *conn).await?;

    let copied = sqlx::query(&format!(
        "INSERT INTO {} ({cols}) SELECT {cols} FROM {}",
        quote_ident(&temp_name),
        quote_ident(table),
        cols = column_list
    ))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    sqlx::query(&format!("DROP TABLE {}", quote_ident(table)))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(&temp_name),
        quote_ident(table)
    ))
    .execute(&mut *conn)
    .await?;

    let mut outcome = RebuildOutcome {
        rows_copied: copied,
        dropped_columns: columns
            .iter()
            .filter(|c| spec.is_dropped(&c.name))
            .map(|c| c.name.clone())
            .collect(),
        ..Default::default()
    };

    for (name, sql) in explicit_sql {
        let Some(sql) = sql else { continue };
        let uses_dropped = indexes
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.columns.iter().any(|c| spec.is_dropped(c)))
            .unwrap_or(false)
            || spec.drop_columns.iter().any(|c| sql.contains(c.as_str()));

        if uses_dropped {
            info!("  Discarding index {} (references a dropped column)", name);
            outcome.discarded_indexes.push(name);
            continue;
        }

        sqlx::query(&sql).execute(&mut *conn).await?;
        outcome.recreated_indexes.push(name);
    }

    for (name, sql) in trigger_sql {
        let Some(sql) = sql else { continue };
        if spec.drop_columns.iter().any(|c| sql.contains(c.as_str())) {
            warn!("  Discarding trigger {} (references a dropped column)", name);
            continue;
        }
        sqlx::query(&sql).execute(&mut *conn).await?;
    }

    info!(
        "  ✓ Rebuilt table '{}' ({} rows, dropped columns: {:?})",
        table, outcome.rows_copied, outcome.dropped_columns
    );

    Ok(outcome)
}

/// Explicit `COLLATE` clauses per column, keyed by lowercased column name
fn declared_collations(table_sql: &str) -> BTreeMap<String, String> {
    let mut collations = BTreeMap::new();
    let (Some(open), Some(close)) = (table_sql.find('('), table_sql.rfind(')')) else {
        return collations;
    };
    if close <= open {
        return collations;
    }

    for definition in split_top_level(&table_sql[open + 1..close]) {
        let tokens = sql_tokens(definition);
        let Some(first) = tokens.first() else { continue };
        let constraint_keyword = ["CONSTRAINT", "PRIMARY", "UNIQUE", "CHECK", "FOREIGN"]
            .iter()
            .any(|k| first.eq_ignore_ascii_case(k));
        if constraint_keyword && !definition.trim_start().starts_with(&['"', '`', '['][..]) {
            continue;
        }
        let collation = tokens
            .windows(2)
            .find(|pair| pair[0].eq_ignore_ascii_case("COLLATE"))
            .map(|pair| pair[1].clone());
        if let Some(collation) = collation {
            collations.insert(first.to_lowercase(), collation);
        }
    }
    collations
}

/// Split on commas outside parentheses and quotes
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in body.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(ch),
            (None, '[') => quote = Some(']'),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}

/// Words and unquoted identifiers of one definition; string literals and
/// parenthesized groups are skipped
fn sql_tokens(definition: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = definition.chars().peekable();
    let mut depth = 0usize;
    while let Some(ch) = chars.next() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '\'' => {
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                }
            }
            '"' | '`' | '[' => {
                let end = if ch == '[' { ']' } else { ch };
                let mut ident = String::new();
                for c in chars.by_ref() {
                    if c == end {
                        break;
                    }
                    ident.push(c);
                }
                if depth == 0 {
                    tokens.push(ident);
                }
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !(next.is_alphanumeric() || next == '_' || next == '$') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                if depth == 0 {
                    tokens.push(word);
                }
            }
            _ => {}
        }
    }
    tokens
}

fn build_table_body(
    spec: &RebuildSpec,
    kept: &[&ActualColumn],
    collations: &BTreeMap<String, String>,
    indexes: &[IndexInfo],
    foreign_keys: &[ForeignKeyInfo],
    autoincrement: bool,
) -> String {
    let pk_columns: Vec<&ActualColumn> = {
        let mut pk: Vec<&ActualColumn> = kept.iter().copied().filter(|c| c.is_primary_key()).collect();
        pk.sort_by_key(|c| c.pk);
        pk
    };
    let inline_pk = pk_columns.len() == 1;

    let mut parts = Vec::new();

    for column in kept {
        let mut def = quote_ident(&column.name);
        if !column.type_name.is_empty() {
            def.push(' ');
            def.push_str(&column.type_name);
        }
        if let Some(collation) = collations.get(&column.name.to_lowercase()) {
            def.push_str(&format!(" COLLATE {}", quote_ident(collation)));
        }
        if inline_pk && column.is_primary_key() {
            def.push_str(" PRIMARY KEY");
            if autoincrement {
                def.push_str(" AUTOINCREMENT");
            }
        }
        let not_null = spec.not_null_override(&column.name).unwrap_or(column.not_null);
        if not_null {
            def.push_str(" NOT NULL");
        }
        // table_info strips the parentheses of expression defaults
        if let Some(default) = &column.default_value {
            def.push_str(&format!(" DEFAULT ({})", default));
        }
        parts.push(def);
    }

    if pk_columns.len() > 1 {
        parts.push(format!(
            "PRIMARY KEY ({})",
            pk_columns
                .iter()
                .map(|c| quote_ident(&c.name))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    for index in indexes.iter().filter(|i| i.origin == "u") {
        if index.columns.is_empty() || index.columns.iter().any(|c| spec.is_dropped(c)) {
            continue;
        }
        parts.push(format!(
            "UNIQUE ({})",
            index
                .columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    let mut grouped: BTreeMap<i64, Vec<&ForeignKeyInfo>> = BTreeMap::new();
    for fk in foreign_keys {
        grouped.entry(fk.id).or_default().push(fk);
    }
    for (_, group) in grouped {
        if group.iter().any(|fk| spec.is_dropped(&fk.from_column)) {
            continue;
        }
        let from = group
            .iter()
            .map(|fk| quote_ident(&fk.from_column))
            .collect::<Vec<_>>()
            .join(", ");
        let target = &group[0].target_table;
        let to: Vec<String> = group
            .iter()
            .filter_map(|fk| fk.target_column.as_deref().map(quote_ident))
            .collect();
        let mut clause = if to.len() == group.len() {
            format!("FOREIGN KEY ({}) REFERENCES {} ({})", from, quote_ident(target), to.join(", "))
        } else {
            format!("FOREIGN KEY ({}) REFERENCES {}", from, quote_ident(target))
        };
        if group[0].on_delete != "NO ACTION" {
            clause.push_str(&format!(" ON DELETE {}", group[0].on_delete));
        }
        if group[0].on_update != "NO ACTION" {
            clause.push_str(&format!(" ON UPDATE {}", group[0].on_update));
        }
        parts.push(clause);
    }

    parts.join(",\n    ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::memory_pool;
    use sqlx::{Connection, SqlitePool};

    async fn setup(pool: &SqlitePool) {
        sqlx::query("CREATE TABLE accounts (id INTEGER PRIMARY KEY AUTOINCREMENT, legacy_key TEXT UNIQUE, token TEXT, email TEXT, created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("CREATE INDEX ix_accounts_email ON accounts(email)")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("CREATE INDEX ix_accounts_legacy ON accounts(legacy_key, token)")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE sessions (id INTEGER PRIMARY KEY, account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE)",
        )
        .execute(pool)
        .await
        .unwrap();
    }

    async fn rebuild(pool: &SqlitePool, spec: &RebuildSpec) -> Result<RebuildOutcome> {
        let mut conn = pool.acquire().await?;
        sqlx::query("PRAGMA foreign_keys = OFF").execute(&mut *conn).await?;
        let mut tx = conn.begin().await?;
        let outcome = rebuild_table(&mut tx, spec).await;
        match outcome {
            Ok(outcome) => {
                tx.commit().await?;
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                Ok(outcome)
            }
            Err(e) => {
                tx.rollback().await?;
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                Err(e)
            }
        }
    }

    #[tokio::test]
    async fn test_rebuild_drops_column_and_sets_not_null() {
        let pool = memory_pool().await.unwrap();
        setup(&pool).await;

        sqlx::query("INSERT INTO accounts (legacy_key, token, email) VALUES ('a', 't1', 'a@x.io'), ('b', 't2', NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO sessions (account_id) VALUES (1), (2)")
            .execute(&pool)
            .await
            .unwrap();

        let spec = RebuildSpec::new("accounts")
            .drop_column("legacy_key")
            .set_not_null("token", true);
        let outcome = rebuild(&pool, &spec).await.unwrap();

        assert_eq!(outcome.rows_copied, 2);
        assert_eq!(outcome.dropped_columns, vec!["legacy_key".to_string()]);
        assert_eq!(outcome.recreated_indexes, vec!["ix_accounts_email".to_string()]);
        assert_eq!(outcome.discarded_indexes, vec!["ix_accounts_legacy".to_string()]);

        let columns = SchemaIntrospector::introspect_table(&pool, "accounts").await.unwrap();
        assert!(!columns.iter().any(|c| c.name == "legacy_key"));
        assert!(columns.iter().find(|c| c.name == "token").unwrap().not_null);

        let table_sql = SchemaIntrospector::table_sql(&pool, "accounts").await.unwrap().unwrap();
        assert!(table_sql.contains("AUTOINCREMENT"));

        // Children still resolve against the rebuilt parent
        let violations: Vec<(String,)> = sqlx::query_as("SELECT \"table\" FROM pragma_foreign_key_check")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert!(violations.is_empty());
        let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(sessions, 2);
    }

    #[tokio::test]
    async fn test_rebuild_not_null_with_null_data_fails_and_rolls_back() {
        let pool = memory_pool().await.unwrap();
        setup(&pool).await;

        sqlx::query("INSERT INTO accounts (legacy_key, token) VALUES ('a', NULL)")
            .execute(&pool)
            .await
            .unwrap();

        let spec = RebuildSpec::new("accounts").set_not_null("token", true);
        assert!(rebuild(&pool, &spec).await.is_err());

        let columns = SchemaIntrospector::introspect_table(&pool, "accounts").await.unwrap();
        assert!(columns.iter().any(|c| c.name == "legacy_key"));
        assert!(!columns.iter().find(|c| c.name == "token").unwrap().not_null);
    }

    #[tokio::test]
    async fn test_rebuild_refuses_check_constraints() {
        let pool = memory_pool().await.unwrap();
        sqlx::query("CREATE TABLE kinds (id INTEGER PRIMARY KEY, kind TEXT CHECK (kind IN ('a', 'b')))")
            .execute(&pool)
            .await
            .unwrap();

        let result = rebuild(&pool, &RebuildSpec::new("kinds")).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_rebuild_keeps_expression_defaults_and_collations() {
        let pool = memory_pool().await.unwrap();
        sqlx::query("CREATE TABLE teams (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE users (
                id INTEGER PRIMARY KEY,
                legacy TEXT,
                uid TEXT,
                email TEXT COLLATE NOCASE,
                \"Display Name\" TEXT COLLATE RTRIM DEFAULT 'fan, new',
                favorite_team_id INTEGER REFERENCES teams(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                score INTEGER DEFAULT -1
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO users (legacy, uid, email) VALUES ('l1', 'fb_1', 'a@x.io')")
            .execute(&pool)
            .await
            .unwrap();

        let spec = RebuildSpec::new("users").drop_column("legacy").set_not_null("uid", true);
        rebuild(&pool, &spec).await.unwrap();

        let table_sql = SchemaIntrospector::table_sql(&pool, "users").await.unwrap().unwrap();
        assert!(table_sql.contains("\"email\" TEXT COLLATE \"NOCASE\""), "{}", table_sql);
        assert!(table_sql.contains("COLLATE \"RTRIM\""), "{}", table_sql);

        let matched: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE email = 'A@X.IO'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(matched, 1);

        // expression and signed defaults still apply after the rebuild
        sqlx::query("INSERT INTO users (uid) VALUES ('fb_2')")
            .execute(&pool)
            .await
            .unwrap();
        let (created_at, score, display): (String, i64, String) = sqlx::query_as(
            "SELECT created_at, score, \"Display Name\" FROM users WHERE uid = 'fb_2'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(!created_at.is_empty());
        assert_eq!(score, -1);
        assert_eq!(display, "fan, new");

        let fks = SchemaIntrospector::foreign_keys(&pool, "users").await.unwrap();
        assert_eq!(fks.len(), 1);
        assert_eq!(fks[0].from_column, "favorite_team_id");
        assert_eq!(fks[0].on_delete, "SET NULL");
    }

    #[tokio::test]
    async fn test_rebuild_refuses_generated_columns() {
        let pool = memory_pool().await.unwrap();
        sqlx::query(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT, domain TEXT GENERATED ALWAYS AS (substr(email, instr(email, '@') + 1)) VIRTUAL)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let result = rebuild(&pool, &RebuildSpec::new("users")).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_declared_collations() {
        let collations = declared_collations(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, [Nick] TEXT collate nocase, \
             note TEXT DEFAULT 'x COLLATE y', CONSTRAINT uq UNIQUE (id, note))",
        );
        assert_eq!(collations.len(), 1);
        assert_eq!(collations.get("nick").map(String::as_str), Some("nocase"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
