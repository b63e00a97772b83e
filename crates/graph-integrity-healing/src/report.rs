//! Run reports and the sinks that record them.
//!
//! A sink has no error channel: whatever goes wrong while recording a report is logged and
//! dropped so a scheduled run is never aborted by its reporting step.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use graph_integrity_core::{HealthCheckResult, IntegrityIssue, RepairSession};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Nightly,
    Weekly,
}

impl ReportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nightly => "nightly",
            Self::Weekly => "weekly",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub kind: ReportKind,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub health: HealthCheckResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<IntegrityIssue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair_session: Option<RepairSession>,
    /// Why the run failed, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    #[must_use]
    pub fn new(kind: ReportKind, health: HealthCheckResult) -> Self {
        Self {
            kind,
            generated_at: OffsetDateTime::now_utc(),
            health,
            issues: None,
            repair_session: None,
            error: None,
        }
    }

    /// `None` means no census was taken, which is not the same as an empty one.
    #[must_use]
    pub fn with_issues(mut self, issues: Option<Vec<IntegrityIssue>>) -> Self {
        self.issues = issues;
        self
    }

    #[must_use]
    pub fn with_repair_session(mut self, session: Option<RepairSession>) -> Self {
        self.repair_session = session;
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }
}

pub trait ReportSink: Send + Sync {
    fn create_report(&self, report: &RunReport);
}

/// Writes a one-line summary of each report to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReportSink;

impl ReportSink for TracingReportSink {
    fn create_report(&self, report: &RunReport) {
        info!(
            kind = report.kind.as_str(),
            status = %report.health.status,
            failed_checks = report.health.failed_checks().count(),
            issues = report.issues.as_ref().map_or(0, Vec::len),
            repair_session =
                report.repair_session.as_ref().map_or("", |session| session.id.as_str()),
            error = report.error.as_deref().unwrap_or_default(),
            "run report"
        );
    }
}

/// Appends each report as one JSON line.
#[derive(Debug)]
pub struct JsonlReportSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlReportSink {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, report: &RunReport) -> Result<()> {
        let mut line = serde_json::to_string(report).context("failed to encode run report")?;
        line.push('\n');

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open report file {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to report file {}", self.path.display()))?;
        Ok(())
    }
}

impl ReportSink for JsonlReportSink {
    fn create_report(&self, report: &RunReport) {
        if let Err(err) = self.append(report) {
            warn!(
                kind = report.kind.as_str(),
                error = %format!("{err:#}"),
                "failed to record run report"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use graph_integrity_core::{IssueType, ProbeOutcome, Severity};

    use super::*;

    fn health() -> HealthCheckResult {
        HealthCheckResult::from_checks(
            vec![ProbeOutcome {
                name: "orphan_edges".to_string(),
                critical: false,
                passed: false,
                timed_out: false,
                message: "1 orphan edges".to_string(),
                duration_ms: 2,
            }],
            OffsetDateTime::now_utc(),
        )
    }

    #[test]
    fn jsonl_sink_appends_one_line_per_report() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = JsonlReportSink::new(dir.path().join("reports.jsonl"));

        sink.create_report(&RunReport::new(ReportKind::Nightly, health()));
        sink.create_report(&RunReport::new(ReportKind::Weekly, health()).with_issues(Some(vec![
            IntegrityIssue::new(IssueType::OrphanEdge, "a->b", "Edge a -> b", Severity::Medium),
        ])));

        let raw = fs::read_to_string(sink.path())?;
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(first["kind"], "nightly");
        assert_eq!(first["health"]["status"], "degraded");
        assert!(first.get("issues").is_none());
        assert!(first.get("error").is_none());
        let second: RunReport = serde_json::from_str(lines[1])?;
        assert_eq!(second.kind, ReportKind::Weekly);
        assert_eq!(second.issues.map(|issues| issues.len()), Some(1));
        Ok(())
    }

    #[test]
    fn jsonl_sink_swallows_io_errors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = JsonlReportSink::new(dir.path().join("missing").join("reports.jsonl"));
        sink.create_report(&RunReport::new(ReportKind::Nightly, health()));
        assert!(!sink.path().exists());
        Ok(())
    }
}
