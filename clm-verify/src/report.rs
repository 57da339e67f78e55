//! Verification report

use chrono::{DateTime, Utc};
use clm_common::{HealthReport, Result};
use serde::Serialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub database_path: String,
    pub generated_at: DateTime<Utc>,
    pub compliance_percent: f64,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub checks: HealthReport,
}

impl VerificationReport {
    pub fn new(database_path: &Path, checks: HealthReport) -> Self {
        Self {
            database_path: database_path.display().to_string(),
            generated_at: Utc::now(),
            compliance_percent: checks.compliance_percent(),
            passed: checks.passed(),
            failed: checks.failed(),
            warnings: checks.warnings(),
            checks,
        }
    }

    pub fn is_compliant(&self) -> bool {
        self.checks.is_compliant()
    }

    pub fn render(&self) -> String {
        format!(
            "Schema verification of {} at {}\n{}",
            self.database_path,
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.checks.render()
        )
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!("Wrote verification report to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clm_common::CheckResult;

    #[test]
    fn test_json_shape() {
        let mut checks = HealthReport::new();
        checks.push(CheckResult::pass("table:users", "tables", "present"));
        checks.push(CheckResult::fail("retired:users.clerk_user_id", "columns", "still present"));

        let report = VerificationReport::new(Path::new("/srv/clm.db"), checks);
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["database_path"], "/srv/clm.db");
        assert_eq!(value["compliance_percent"], 50.0);
        assert_eq!(value["failed"], 1);
        assert_eq!(value["checks"]["checks"][1]["status"], "fail");
        assert!(!report.is_compliant());
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        VerificationReport::new(Path::new("clm.db"), HealthReport::new())
            .write_json(&path)
            .unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["compliance_percent"], 100.0);
    }
}
