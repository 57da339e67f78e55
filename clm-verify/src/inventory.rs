//! Expected schema inventory
//!
//! [`Inventory::default`] is the checklist of the fully migrated schema:
//! required columns per table, columns that must be gone, unique and
//! partial indexes, enum-like CHECK constraints and foreign keys. Indexes
//! are matched by table, key columns and flags rather than by name, so a
//! UNIQUE table constraint satisfies the same entry as a named unique index.

use clm_common::db::{expected_table_schemas, ColumnDefinition, SchemaDiff, SchemaIntrospector};
use clm_common::{CheckResult, HealthReport, Result};
use clm_identity::phase3::{EMAIL_UNIQUE_INDEX, UID_UNIQUE_INDEX};
use sqlx::SqlitePool;

#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedIndex {
    /// Display name; the live index may be named differently
    pub name: &'static str,
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub unique: bool,
    pub partial: bool,
}

impl ExpectedIndex {
    fn new(name: &'static str, table: &'static str, columns: &[&'static str]) -> Self {
        Self {
            name,
            table,
            columns: columns.to_vec(),
            unique: false,
            partial: false,
        }
    }

    fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    fn partial(mut self) -> Self {
        self.partial = true;
        self
    }
}

/// Text column restricted to a fixed set of values by a CHECK constraint
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedEnum {
    pub table: &'static str,
    pub column: &'static str,
    pub values: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedForeignKey {
    pub table: &'static str,
    pub column: &'static str,
    pub references: &'static str,
}

#[derive(Debug, Clone)]
pub struct Inventory {
    pub columns: Vec<(&'static str, Vec<ColumnDefinition>)>,
    /// (table, column) pairs that must no longer exist
    pub retired_columns: Vec<(&'static str, &'static str)>,
    pub indexes: Vec<ExpectedIndex>,
    pub enums: Vec<ExpectedEnum>,
    pub foreign_keys: Vec<ExpectedForeignKey>,
}

impl Default for Inventory {
    fn default() -> Self {
        let mut columns = expected_table_schemas();
        // Phase 1 adds firebase_uid as nullable; the final schema requires it
        for (table, definitions) in columns.iter_mut() {
            if *table == "users" {
                for column in definitions.iter_mut().filter(|c| c.name == "firebase_uid") {
                    column.not_null = true;
                }
            }
        }

        let fk = |table, column, references| ExpectedForeignKey {
            table,
            column,
            references,
        };

        Self {
            columns,
            retired_columns: vec![("users", "clerk_user_id")],
            indexes: vec![
                ExpectedIndex::new(UID_UNIQUE_INDEX, "users", &["firebase_uid"]).unique(),
                ExpectedIndex::new(EMAIL_UNIQUE_INDEX, "users", &["email"]).unique().partial(),
                ExpectedIndex::new("sports.slug", "sports", &["slug"]).unique(),
                ExpectedIndex::new("leagues.slug", "leagues", &["slug"]).unique(),
                ExpectedIndex::new(
                    "team_league_memberships.team_league_season",
                    "team_league_memberships",
                    &["team_id", "league_id", "season_start_year"],
                )
                .unique(),
                ExpectedIndex::new(
                    "ix_team_league_memberships_team_active",
                    "team_league_memberships",
                    &["team_id", "is_active"],
                ),
                ExpectedIndex::new(
                    "user_sport_preferences.user_sport",
                    "user_sport_preferences",
                    &["user_id", "sport_id"],
                )
                .unique(),
                ExpectedIndex::new(
                    "user_team_preferences.user_team",
                    "user_team_preferences",
                    &["user_id", "team_id"],
                )
                .unique(),
            ],
            enums: vec![ExpectedEnum {
                table: "leagues",
                column: "competition_type",
                values: vec!["league", "conference", "division", "tournament"],
            }],
            foreign_keys: vec![
                fk("leagues", "sport_id", "sports"),
                fk("teams", "sport_id", "sports"),
                fk("team_league_memberships", "team_id", "teams"),
                fk("team_league_memberships", "league_id", "leagues"),
                fk("user_sport_preferences", "user_id", "users"),
                fk("user_sport_preferences", "sport_id", "sports"),
                fk("user_team_preferences", "user_id", "users"),
                fk("user_team_preferences", "team_id", "teams"),
            ],
        }
    }
}

impl Inventory {
    /// Run every schema check against the live database
    pub async fn check(&self, pool: &SqlitePool) -> Result<HealthReport> {
        let mut report = HealthReport::new();

        for (table, _) in &self.columns {
            report.push(if SchemaIntrospector::table_exists(pool, table).await? {
                CheckResult::pass(format!("table:{}", table), "tables", "present")
            } else {
                CheckResult::fail(format!("table:{}", table), "tables", "missing")
            });
        }

        for (table, expected) in &self.columns {
            let actual = SchemaIntrospector::introspect_table(pool, table).await?;
            let drift = SchemaDiff::compare(table, expected, &actual);
            report.push(if drift.is_empty() {
                CheckResult::pass(
                    format!("columns:{}", table),
                    "columns",
                    format!("{} column(s) as expected", expected.len()),
                )
            } else {
                let detail: Vec<String> = drift.iter().map(|d| d.describe()).collect();
                CheckResult::fail(format!("columns:{}", table), "columns", detail.join("; "))
                    .with_count(drift.len() as i64)
            });
        }

        for (table, column) in &self.retired_columns {
            let name = format!("retired:{}.{}", table, column);
            report.push(if SchemaIntrospector::column_exists(pool, table, column).await? {
                CheckResult::fail(name, "columns", "still present")
            } else {
                CheckResult::pass(name, "columns", "removed")
            });
        }

        for expected in &self.indexes {
            report.push(check_index(pool, expected).await?);
        }

        for expected in &self.enums {
            report.push(check_enum(pool, expected).await?);
        }

        for expected in &self.foreign_keys {
            let name = format!("fk:{}.{}", expected.table, expected.column);
            let present = SchemaIntrospector::foreign_keys(pool, expected.table)
                .await?
                .iter()
                .any(|fk| fk.from_column == expected.column && fk.target_table == expected.references);
            report.push(if present {
                CheckResult::pass(name, "foreign_keys", format!("references {}", expected.references))
            } else {
                CheckResult::fail(name, "foreign_keys", format!("no reference to {}", expected.references))
            });
        }

        Ok(report)
    }
}

async fn check_index(pool: &SqlitePool, expected: &ExpectedIndex) -> Result<CheckResult> {
    let name = format!("index:{}", expected.name);
    let indexes = SchemaIntrospector::index_list_pool(pool, expected.table).await?;

    let found = indexes.iter().find(|index| {
        index.columns == expected.columns
            && index.unique == expected.unique
            && index.partial == expected.partial
    });

    Ok(match found {
        Some(index) => CheckResult::pass(name, "indexes", format!("{} on {}", index.name, expected.table)),
        None => {
            let kind = match (expected.unique, expected.partial) {
                (true, true) => "partial unique index",
                (true, false) => "unique index",
                (false, _) => "index",
            };
            CheckResult::fail(
                name,
                "indexes",
                format!("no {} on {}({})", kind, expected.table, expected.columns.join(", ")),
            )
        }
    })
}

/// SQLite has no enum types; look for a CHECK naming the column and every value
async fn check_enum(pool: &SqlitePool, expected: &ExpectedEnum) -> Result<CheckResult> {
    let name = format!("enum:{}.{}", expected.table, expected.column);
    let Some(sql) = SchemaIntrospector::table_sql(pool, expected.table).await? else {
        return Ok(CheckResult::fail(name, "enums", format!("table {} missing", expected.table)));
    };

    let sql = sql.to_lowercase();
    let constrained = sql.contains("check")
        && sql.contains(&format!("{} in", expected.column))
        && expected
            .values
            .iter()
            .all(|value| sql.contains(&format!("'{}'", value)));

    Ok(if constrained {
        CheckResult::pass(name, "enums", expected.values.join(" | "))
    } else {
        CheckResult::fail(
            name,
            "enums",
            format!("no CHECK restricting {} to {}", expected.column, expected.values.join(", ")),
        )
    })
}
