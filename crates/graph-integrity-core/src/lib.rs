use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod store;

pub use store::{MutationOutcome, RelationalStore, Row, SqlValue, StoreError};

/// Description attached to the only `InvalidData` case the repair engine fixes on its own.
pub const MISSING_TITLE_DESCRIPTION: &str = "Node has no title";
/// Prefix of the placeholder written over a missing title.
pub const PLACEHOLDER_TITLE_PREFIX: &str = "[NEEDS REVIEW] Untitled node";

pub const ACTION_NO_ACTION_NEEDED: &str = "NO_ACTION_NEEDED";
pub const ACTION_REPORTED_ONLY: &str = "REPORTED_ONLY";
pub const ACTION_SKIPPED: &str = "SKIPPED";
pub const ACTION_FAILED: &str = "FAILED";
pub const DRY_RUN_PREFIX: &str = "DRY_RUN: ";

const EDGE_ID_SEPARATOR: &str = "->";

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum IntegrityError {
    #[error("integrity scan failed: {0}")]
    Scan(#[source] StoreError),
    #[error("repair session {session_id} failed: {message}")]
    Session { session_id: String, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid schedule config: {0}")]
    InvalidConfig(String),
    #[error("scheduled task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    OrphanEdge,
    InvalidData,
    Duplicate,
    MissingReference,
}

impl IssueType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OrphanEdge => "orphan_edge",
            Self::InvalidData => "invalid_data",
            Self::Duplicate => "duplicate",
            Self::MissingReference => "missing_reference",
        }
    }
}

impl Display for IssueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct IntegrityIssue {
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub record_id: String,
    pub description: String,
    pub severity: Severity,
}

impl IntegrityIssue {
    #[must_use]
    pub fn new(
        issue_type: IssueType,
        record_id: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            issue_type,
            record_id: record_id.into(),
            description: description.into(),
            severity,
        }
    }

    #[must_use]
    pub fn is_missing_title(&self) -> bool {
        self.issue_type == IssueType::InvalidData && self.description == MISSING_TITLE_DESCRIPTION
    }
}

/// Record id of an edge issue: `"parentId->childId"`.
#[must_use]
pub fn edge_record_id(parent_id: &str, child_id: &str) -> String {
    format!("{parent_id}{EDGE_ID_SEPARATOR}{child_id}")
}

#[must_use]
pub fn parse_edge_record_id(record_id: &str) -> Option<(&str, &str)> {
    let (parent, child) = record_id.split_once(EDGE_ID_SEPARATOR)?;
    if parent.is_empty() || child.is_empty() {
        return None;
    }
    Some((parent, child))
}

/// A node row exactly as persisted; timestamps stay raw so snapshots restore byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub title: Option<String>,
    pub node_type: String,
    pub parent_id: Option<String>,
    pub prev_sibling_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl GraphNode {
    #[must_use]
    pub fn has_title(&self) -> bool {
        self.title.as_deref().is_some_and(|title| !title.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub parent_id: String,
    pub child_id: String,
    pub weight: f64,
    pub relationship_type: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Healthy when every probe passed, Unhealthy when any critical probe failed or timed
    /// out, Degraded otherwise.
    #[must_use]
    pub fn classify(checks: &[ProbeOutcome]) -> Self {
        if checks.iter().any(|check| check.critical && !check.passed) {
            Self::Unhealthy
        } else if checks.iter().any(|check| !check.passed) {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProbeOutcome {
    pub name: String,
    pub critical: bool,
    pub passed: bool,
    pub timed_out: bool,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub checks: Vec<ProbeOutcome>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl HealthCheckResult {
    #[must_use]
    pub fn from_checks(checks: Vec<ProbeOutcome>, timestamp: OffsetDateTime) -> Self {
        Self { status: HealthStatus::classify(&checks), checks, timestamp }
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &ProbeOutcome> {
        self.checks.iter().filter(|check| !check.passed)
    }
}

/// Everything needed to reverse one repair, keyed by the issue type it repaired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackData {
    OrphanEdge { edge: GraphEdge },
    InvalidData { node: GraphNode },
}

impl RollbackData {
    #[must_use]
    pub fn issue_type(&self) -> IssueType {
        match self {
            Self::OrphanEdge { .. } => IssueType::OrphanEdge,
            Self::InvalidData { .. } => IssueType::InvalidData,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairResult {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub issue: IntegrityIssue,
    pub success: bool,
    pub action: String,
    pub rollback_available: bool,
    pub rollback_data: Option<RollbackData>,
    pub error: Option<String>,
}

impl RepairResult {
    fn base(issue: IntegrityIssue, success: bool, action: impl Into<String>) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            issue,
            success,
            action: action.into(),
            rollback_available: false,
            rollback_data: None,
            error: None,
        }
    }

    #[must_use]
    pub fn no_action_needed(issue: IntegrityIssue) -> Self {
        Self::base(issue, true, ACTION_NO_ACTION_NEEDED)
    }

    #[must_use]
    pub fn reported_only(issue: IntegrityIssue, note: &str) -> Self {
        Self::base(issue, true, format!("{ACTION_REPORTED_ONLY}: {note}"))
    }

    #[must_use]
    pub fn skipped(issue: IntegrityIssue, reason: impl Into<String>) -> Self {
        let mut result = Self::base(issue, false, ACTION_SKIPPED);
        result.error = Some(reason.into());
        result
    }

    #[must_use]
    pub fn failed(issue: IntegrityIssue, error: impl Into<String>) -> Self {
        let mut result = Self::base(issue, false, ACTION_FAILED);
        result.error = Some(error.into());
        result
    }

    /// A repair that captured a snapshot, whether or not the mutation was applied.
    #[must_use]
    pub fn applied(
        issue: IntegrityIssue,
        action: impl Into<String>,
        snapshot: RollbackData,
    ) -> Self {
        let mut result = Self::base(issue, true, action);
        result.rollback_available = true;
        result.rollback_data = Some(snapshot);
        result
    }

    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.action.starts_with(DRY_RUN_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl SessionStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairSession {
    pub id: String,
    pub dry_run: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub results: Vec<RepairResult>,
    pub status: SessionStatus,
    pub error: Option<String>,
}

impl RepairSession {
    #[must_use]
    pub fn start(dry_run: bool) -> Self {
        Self {
            id: format!("repair_{}", Ulid::new()),
            dry_run,
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            results: Vec::new(),
            status: SessionStatus::Running,
            error: None,
        }
    }

    /// Rolled back is reachable only from a finished session that mutated something.
    #[must_use]
    pub fn can_roll_back(&self) -> bool {
        matches!(self.status, SessionStatus::Completed | SessionStatus::Failed)
            && !self.dry_run
            && self.results.iter().any(|result| result.rollback_available)
    }

    #[must_use]
    pub fn count_successful(&self) -> usize {
        self.results.iter().filter(|result| result.success).count()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Nightly,
    Weekly,
    Manual,
}

impl TaskType {
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Nightly => "Nightly health check",
            Self::Weekly => "Weekly deep analysis",
            Self::Manual => "Manual health check",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskResult {
    Health { health: HealthCheckResult },
    Repair { session: RepairSession },
    DeepAnalysis {
        health: HealthCheckResult,
        issues: Vec<IntegrityIssue>,
        repair_session: Option<RepairSession>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub executed_time: Option<OffsetDateTime>,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
}

impl ScheduledTask {
    #[must_use]
    pub fn pending(task_type: TaskType, scheduled_time: OffsetDateTime) -> Self {
        Self {
            id: format!("task_{}", Ulid::new()),
            name: task_type.display_name().to_string(),
            task_type,
            scheduled_time,
            executed_time: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub nightly_check_enabled: bool,
    pub nightly_check_hour: u8,
    pub weekly_deep_analysis_enabled: bool,
    /// 0 = Sunday.
    pub weekly_deep_analysis_day: u8,
    pub auto_repair_enabled: bool,
    pub auto_repair_dry_run_only: bool,
    pub reporting_enabled: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            nightly_check_enabled: true,
            nightly_check_hour: 2,
            weekly_deep_analysis_enabled: true,
            weekly_deep_analysis_day: 0,
            auto_repair_enabled: true,
            auto_repair_dry_run_only: true,
            reporting_enabled: true,
        }
    }
}

impl ScheduleConfig {
    /// # Errors
    /// Returns `InvalidConfig` when the hour or weekday is out of range.
    pub fn validate(&self) -> Result<(), IntegrityError> {
        if self.nightly_check_hour > 23 {
            return Err(IntegrityError::InvalidConfig(format!(
                "nightly_check_hour must be 0-23, got {}",
                self.nightly_check_hour
            )));
        }
        if self.weekly_deep_analysis_day > 6 {
            return Err(IntegrityError::InvalidConfig(format!(
                "weekly_deep_analysis_day must be 0-6, got {}",
                self.weekly_deep_analysis_day
            )));
        }
        Ok(())
    }

    /// Apply a partial update; nothing is applied unless the merged result is valid.
    ///
    /// # Errors
    /// Returns `InvalidConfig` when the merged configuration fails validation.
    pub fn merged(&self, patch: &ScheduleConfigPatch) -> Result<Self, IntegrityError> {
        let merged = Self {
            nightly_check_enabled: patch
                .nightly_check_enabled
                .unwrap_or(self.nightly_check_enabled),
            nightly_check_hour: patch.nightly_check_hour.unwrap_or(self.nightly_check_hour),
            weekly_deep_analysis_enabled: patch
                .weekly_deep_analysis_enabled
                .unwrap_or(self.weekly_deep_analysis_enabled),
            weekly_deep_analysis_day: patch
                .weekly_deep_analysis_day
                .unwrap_or(self.weekly_deep_analysis_day),
            auto_repair_enabled: patch.auto_repair_enabled.unwrap_or(self.auto_repair_enabled),
            auto_repair_dry_run_only: patch
                .auto_repair_dry_run_only
                .unwrap_or(self.auto_repair_dry_run_only),
            reporting_enabled: patch.reporting_enabled.unwrap_or(self.reporting_enabled),
        };
        merged.validate()?;
        Ok(merged)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ScheduleConfigPatch {
    pub nightly_check_enabled: Option<bool>,
    pub nightly_check_hour: Option<u8>,
    pub weekly_deep_analysis_enabled: Option<bool>,
    pub weekly_deep_analysis_day: Option<u8>,
    pub auto_repair_enabled: Option<bool>,
    pub auto_repair_dry_run_only: Option<bool>,
    pub reporting_enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, critical: bool, passed: bool) -> ProbeOutcome {
        ProbeOutcome {
            name: name.to_string(),
            critical,
            passed,
            timed_out: false,
            message: String::new(),
            duration_ms: 1,
        }
    }

    #[test]
    fn classify_follows_check_criticality() {
        // (critical check passed, non-critical check passed)
        let cases = [
            (true, true, HealthStatus::Healthy),
            (true, false, HealthStatus::Degraded),
            (false, true, HealthStatus::Unhealthy),
            (false, false, HealthStatus::Unhealthy),
        ];
        for (critical_passed, optional_passed, expected) in cases {
            let checks = [
                outcome("connectivity", true, critical_passed),
                outcome("orphan_edges", false, optional_passed),
            ];
            assert_eq!(HealthStatus::classify(&checks), expected);
        }

        assert_eq!(HealthStatus::classify(&[]), HealthStatus::Healthy);
    }

    #[test]
    fn edge_record_ids_round_trip_and_reject_malformed_input() {
        let id = edge_record_id("n1", "n2");
        assert_eq!(id, "n1->n2");
        assert_eq!(parse_edge_record_id(&id), Some(("n1", "n2")));
        assert_eq!(parse_edge_record_id("n1"), None);
        assert_eq!(parse_edge_record_id("->n2"), None);
    }

    #[test]
    fn merged_config_rejects_out_of_range_values_without_partial_apply() {
        let base = ScheduleConfig::default();
        let patch = ScheduleConfigPatch {
            nightly_check_hour: Some(24),
            reporting_enabled: Some(false),
            ..ScheduleConfigPatch::default()
        };
        assert!(matches!(base.merged(&patch), Err(IntegrityError::InvalidConfig(_))));

        let patch = ScheduleConfigPatch {
            nightly_check_hour: Some(3),
            weekly_deep_analysis_day: Some(6),
            ..ScheduleConfigPatch::default()
        };
        let Ok(merged) = base.merged(&patch) else {
            panic!("valid patch should merge");
        };
        assert_eq!(merged.nightly_check_hour, 3);
        assert_eq!(merged.weekly_deep_analysis_day, 6);
        assert_eq!(merged.reporting_enabled, base.reporting_enabled);
    }

    #[test]
    fn sessions_without_snapshots_cannot_roll_back() {
        let mut session = RepairSession::start(false);
        let issue = IntegrityIssue::new(IssueType::Duplicate, "n1", "dup", Severity::Low);
        session.results.push(RepairResult::reported_only(issue, "manual review required"));
        session.status = SessionStatus::Completed;
        assert!(!session.can_roll_back());
    }

    #[test]
    fn issue_serializes_type_field() -> Result<(), serde_json::Error> {
        let issue =
            IntegrityIssue::new(IssueType::OrphanEdge, "n1->n2", "orphan", Severity::Medium);
        let json = serde_json::to_value(&issue)?;
        assert_eq!(json["type"], "orphan_edge");
        assert_eq!(json["record_id"], "n1->n2");
        Ok(())
    }
}
