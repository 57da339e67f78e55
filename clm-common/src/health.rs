//! Structured health-check results
//!
//! Every validator in the toolkit (identity pre-flight, repair post-flight,
//! inventory verifier) reports through the same shape: a named check with a
//! pass/warn/fail status and an optional offending-row count. Reports
//! aggregate checks into a compliance percentage.

use serde::{Deserialize, Serialize};

/// Outcome of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    /// Non-fatal finding; counts as passed for compliance
    Warn,
    Fail,
}

impl CheckStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "✓",
            CheckStatus::Warn => "⚠",
            CheckStatus::Fail => "✗",
        }
    }
}

/// Result of one check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name (e.g. "table:users", "identity:null_firebase_uid")
    pub name: String,
    /// Grouping used in reports (e.g. "tables", "indexes", "data")
    pub category: String,
    pub status: CheckStatus,
    /// Number of offending rows/objects, when meaningful
    pub count: Option<i64>,
    /// Human-readable detail
    pub detail: String,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, category: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            status: CheckStatus::Pass,
            count: None,
            detail: detail.into(),
        }
    }

    pub fn warn(name: impl Into<String>, category: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warn,
            ..Self::pass(name, category, detail)
        }
    }

    pub fn fail(name: impl Into<String>, category: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Fail,
            ..Self::pass(name, category, detail)
        }
    }

    /// Build a count-based check: zero offending rows passes, otherwise the
    /// check fails (or warns when `fatal` is false).
    pub fn from_count(
        name: impl Into<String>,
        category: impl Into<String>,
        count: i64,
        fatal: bool,
        what: &str,
    ) -> Self {
        let status = if count == 0 {
            CheckStatus::Pass
        } else if fatal {
            CheckStatus::Fail
        } else {
            CheckStatus::Warn
        };
        let detail = if count == 0 {
            format!("no {}", what)
        } else {
            format!("{} {}", count, what)
        };
        Self {
            name: name.into(),
            category: category.into(),
            status,
            count: Some(count),
            detail,
        }
    }

    pub fn with_count(mut self, count: i64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn is_failure(&self) -> bool {
        self.status == CheckStatus::Fail
    }
}

/// Aggregated check results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub checks: Vec<CheckResult>,
}

impl HealthReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, check: CheckResult) {
        self.checks.push(check);
    }

    pub fn extend(&mut self, other: HealthReport) {
        self.checks.extend(other.checks);
    }

    pub fn total(&self) -> usize {
        self.checks.len()
    }

    /// Checks that did not fail (warnings included)
    pub fn passed(&self) -> usize {
        self.checks.iter().filter(|c| !c.is_failure()).count()
    }

    pub fn failed(&self) -> usize {
        self.checks.iter().filter(|c| c.is_failure()).count()
    }

    pub fn warnings(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Warn)
            .count()
    }

    /// Percentage of non-failing checks; an empty report is fully compliant
    pub fn compliance_percent(&self) -> f64 {
        if self.checks.is_empty() {
            return 100.0;
        }
        (self.passed() as f64 / self.total() as f64) * 100.0
    }

    pub fn is_compliant(&self) -> bool {
        self.failed() == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.is_failure())
    }

    /// Render one line per check, grouped by category in insertion order
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut current_category: Option<&str> = None;
        for check in &self.checks {
            if current_category != Some(check.category.as_str()) {
                out.push_str(&format!("[{}]\n", check.category));
                current_category = Some(check.category.as_str());
            }
            out.push_str(&format!(
                "  {} {} - {}\n",
                check.status.symbol(),
                check.name,
                check.detail
            ));
        }
        out.push_str(&format!(
            "Compliance: {:.1}% ({}/{} checks passed, {} warnings)\n",
            self.compliance_percent(),
            self.passed(),
            self.total(),
            self.warnings()
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_count_statuses() {
        assert_eq!(
            CheckResult::from_count("a", "data", 0, true, "rows").status,
            CheckStatus::Pass
        );
        assert_eq!(
            CheckResult::from_count("a", "data", 2, true, "rows").status,
            CheckStatus::Fail
        );
        let warn = CheckResult::from_count("a", "data", 2, false, "duplicate emails");
        assert_eq!(warn.status, CheckStatus::Warn);
        assert_eq!(warn.count, Some(2));
        assert_eq!(warn.detail, "2 duplicate emails");
    }

    #[test]
    fn test_compliance_percent() {
        let mut report = HealthReport::new();
        assert_eq!(report.compliance_percent(), 100.0);

        report.push(CheckResult::pass("t1", "tables", "ok"));
        report.push(CheckResult::warn("t2", "data", "meh"));
        report.push(CheckResult::fail("t3", "data", "bad"));
        report.push(CheckResult::pass("t4", "tables", "ok"));

        assert_eq!(report.passed(), 3);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.warnings(), 1);
        assert!((report.compliance_percent() - 75.0).abs() < f64::EPSILON);
        assert!(!report.is_compliant());
    }

    #[test]
    fn test_render_groups_categories() {
        let mut report = HealthReport::new();
        report.push(CheckResult::pass("users", "tables", "present"));
        report.push(CheckResult::fail("orphans", "data", "3 orphaned teams"));

        let text = report.render();
        assert!(text.contains("[tables]"));
        assert!(text.contains("✗ orphans - 3 orphaned teams"));
        assert!(text.contains("Compliance: 50.0%"));
    }
}
