//! Team → league classification rules
//!
//! A [`RuleTable`] is an ordered list of (matcher, league slug) pairs plus a
//! default league for one sport. Matching is a case-insensitive substring
//! test on the team's name, market or display name, and the first matching
//! rule wins. It is plain pattern matching: an ambiguous market such as
//! "Kansas" also matches "Arkansas", so tables list the more specific
//! patterns first and bump `version` whenever the policy changes.
//!
//! Tables are either built in ([`builtin_rule_tables`]) or loaded from TOML:
//!
//! ```toml
//! [[tables]]
//! version = 3
//! sport = "College Football"
//! default_league_slug = "ncaa-fbs"
//!
//! [[tables.rules]]
//! league_slug = "sec"
//! matcher = { kind = "market_contains", pattern = "Alabama" }
//! ```

use clm_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Text of a team the classifier looks at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TeamText<'a> {
    pub name: &'a str,
    pub market: Option<&'a str>,
    pub display_name: Option<&'a str>,
}

impl<'a> From<&'a crate::orphans::OrphanedTeam> for TeamText<'a> {
    fn from(team: &'a crate::orphans::OrphanedTeam) -> Self {
        Self {
            name: &team.name,
            market: team.market.as_deref(),
            display_name: team.display_name.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Matcher {
    NameContains { pattern: String },
    MarketContains { pattern: String },
    DisplayNameContains { pattern: String },
    AnyOf { matchers: Vec<Matcher> },
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    haystack
        .map(|h| h.to_lowercase().contains(&needle.to_lowercase()))
        .unwrap_or(false)
}

impl Matcher {
    pub fn name(pattern: &str) -> Self {
        Matcher::NameContains { pattern: pattern.to_string() }
    }

    pub fn market(pattern: &str) -> Self {
        Matcher::MarketContains { pattern: pattern.to_string() }
    }

    pub fn display_name(pattern: &str) -> Self {
        Matcher::DisplayNameContains { pattern: pattern.to_string() }
    }

    pub fn matches(&self, team: &TeamText<'_>) -> bool {
        match self {
            Matcher::NameContains { pattern } => contains_ci(Some(team.name), pattern),
            Matcher::MarketContains { pattern } => contains_ci(team.market, pattern),
            Matcher::DisplayNameContains { pattern } => contains_ci(team.display_name, pattern),
            Matcher::AnyOf { matchers } => matchers.iter().any(|m| m.matches(team)),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Matcher::NameContains { pattern }
            | Matcher::MarketContains { pattern }
            | Matcher::DisplayNameContains { pattern } => {
                if pattern.trim().is_empty() {
                    Err("empty pattern".to_string())
                } else {
                    Ok(())
                }
            }
            Matcher::AnyOf { matchers } => {
                if matchers.is_empty() {
                    return Err("any_of without matchers".to_string());
                }
                matchers.iter().try_for_each(Matcher::validate)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub matcher: Matcher,
    pub league_slug: String,
}

/// Which part of the table produced a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedRule {
    /// Index into [`RuleTable::rules`]
    Rule(usize),
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub league_slug: String,
    pub matched_rule: MatchedRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTable {
    pub version: u32,
    pub sport: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
    pub default_league_slug: String,
}

impl RuleTable {
    pub fn classify(&self, team: &TeamText<'_>) -> Classification {
        match self.rules.iter().position(|rule| rule.matcher.matches(team)) {
            Some(index) => Classification {
                league_slug: self.rules[index].league_slug.clone(),
                matched_rule: MatchedRule::Rule(index),
            },
            None => Classification {
                league_slug: self.default_league_slug.clone(),
                matched_rule: MatchedRule::Default,
            },
        }
    }

    pub fn applies_to(&self, sport: &str) -> bool {
        self.sport.eq_ignore_ascii_case(sport)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_league_slug.trim().is_empty() {
            return Err(Error::Config(format!("rule table '{}' has no default league", self.sport)));
        }
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.league_slug.trim().is_empty() {
                return Err(Error::Config(format!(
                    "rule table '{}' rule {} has no league",
                    self.sport, index
                )));
            }
            rule.matcher.validate().map_err(|e| {
                Error::Config(format!("rule table '{}' rule {}: {}", self.sport, index, e))
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    tables: Vec<RuleTable>,
}

/// Parse and validate a TOML rule file
pub fn parse_rule_tables(content: &str) -> Result<Vec<RuleTable>> {
    let file: RuleFile = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
    for table in &file.tables {
        table.validate()?;
    }
    Ok(file.tables)
}

pub fn load_rule_tables(path: &Path) -> Result<Vec<RuleTable>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
    let tables = parse_rule_tables(&content)?;
    info!("Loaded {} rule table(s) from {}", tables.len(), path.display());
    Ok(tables)
}

/// Table for `sport`, if any
pub fn table_for<'a>(tables: &'a [RuleTable], sport: &str) -> Option<&'a RuleTable> {
    tables.iter().find(|t| t.applies_to(sport))
}

fn conference(league_slug: &str, markets: &[&str]) -> Rule {
    Rule {
        matcher: Matcher::AnyOf {
            matchers: markets
                .iter()
                .flat_map(|m| [Matcher::market(m), Matcher::display_name(m)])
                .collect(),
        },
        league_slug: league_slug.to_string(),
    }
}

fn single_league(sport: &str, league_slug: &str) -> RuleTable {
    RuleTable {
        version: 1,
        sport: sport.to_string(),
        rules: Vec::new(),
        default_league_slug: league_slug.to_string(),
    }
}

/// Rule tables shipped with the tool
pub fn builtin_rule_tables() -> Vec<RuleTable> {
    vec![
        single_league("Basketball", "nba"),
        RuleTable {
            version: 2,
            sport: "Football".to_string(),
            rules: vec![Rule {
                matcher: Matcher::AnyOf {
                    matchers: vec![
                        Matcher::market("Saskatchewan"),
                        Matcher::market("Winnipeg"),
                        Matcher::market("Calgary"),
                        Matcher::market("Edmonton"),
                        Matcher::market("Hamilton"),
                        Matcher::market("Montreal"),
                        Matcher::market("Ottawa"),
                        Matcher::market("British Columbia"),
                        Matcher::name("Argonauts"),
                    ],
                },
                league_slug: "cfl".to_string(),
            }],
            default_league_slug: "nfl".to_string(),
        },
        single_league("Baseball", "mlb"),
        single_league("Hockey", "nhl"),
        RuleTable {
            version: 2,
            sport: "Soccer".to_string(),
            rules: vec![
                Rule {
                    matcher: Matcher::AnyOf {
                        matchers: ["Arsenal", "Chelsea", "Liverpool", "Manchester", "Tottenham", "Everton", "Newcastle"]
                            .iter()
                            .map(|p| Matcher::display_name(p))
                            .collect(),
                    },
                    league_slug: "premier-league".to_string(),
                },
                Rule {
                    matcher: Matcher::name("NWSL"),
                    league_slug: "nwsl".to_string(),
                },
            ],
            default_league_slug: "mls".to_string(),
        },
        RuleTable {
            version: 3,
            sport: "College Football".to_string(),
            rules: vec![
                // Multi-word markets before the single words they contain
                conference("acc", &["Florida State", "Miami", "Clemson", "North Carolina", "Virginia Tech", "Louisville"]),
                conference("big-12", &["Kansas State", "Oklahoma State", "Texas Tech", "Iowa State", "Baylor", "TCU"]),
                conference("big-ten", &["Ohio State", "Michigan", "Penn State", "Wisconsin", "Iowa", "Oregon", "USC"]),
                conference("sec", &["Alabama", "Georgia", "LSU", "Florida", "Tennessee", "Texas", "Oklahoma", "Arkansas"]),
            ],
            default_league_slug: "ncaa-fbs".to_string(),
        },
        RuleTable {
            version: 2,
            sport: "College Basketball".to_string(),
            rules: vec![
                conference("acc", &["Duke", "North Carolina", "Virginia", "Syracuse"]),
                conference("big-east", &["Villanova", "UConn", "Georgetown", "Creighton", "Marquette"]),
                // "Kansas" is a substring of "Arkansas"
                conference("sec", &["Kentucky", "Tennessee", "Auburn", "Alabama", "Arkansas"]),
                conference("big-12", &["Kansas State", "Kansas", "Baylor", "Houston"]),
            ],
            default_league_slug: "ncaa-mbb".to_string(),
        },
    ]
}
