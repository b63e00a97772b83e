//! Repair sessions: sequential per-issue remediation with reversible snapshots.
//!
//! Each issue's mutation is its own atomic statement; there is no transaction spanning a
//! session. Every mutating repair records the full pre-repair row so a session can be
//! replayed backwards by [`RepairEngine::rollback_session`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use graph_integrity_core::{
    parse_edge_record_id, IntegrityError, IntegrityIssue, IssueType, RelationalStore,
    RepairResult, RepairSession, RollbackData, SessionStatus, StoreError, DRY_RUN_PREFIX,
    PLACEHOLDER_TITLE_PREFIX,
};
use parking_lot::Mutex;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::config::RepairConfig;
use crate::graph;
use crate::monitor::HealthMonitor;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RepairStats {
    pub sessions_started: u64,
    pub sessions_failed: u64,
    pub rollbacks: u64,
    pub rollback_failures: u64,
}

#[derive(Default)]
struct Counters {
    sessions_started: AtomicU64,
    sessions_failed: AtomicU64,
    rollbacks: AtomicU64,
    rollback_failures: AtomicU64,
}

pub struct RepairEngine {
    monitor: Arc<HealthMonitor>,
    store: Arc<dyn RelationalStore>,
    sessions: Mutex<HashMap<String, RepairSession>>,
    max_sessions: usize,
    counters: Counters,
}

impl RepairEngine {
    #[must_use]
    pub fn new(monitor: Arc<HealthMonitor>, config: &RepairConfig) -> Self {
        let store = Arc::clone(monitor.store());
        Self {
            monitor,
            store,
            sessions: Mutex::new(HashMap::new()),
            max_sessions: config.max_sessions.max(1),
            counters: Counters::default(),
        }
    }

    /// Scan for issues and repair them one at a time.
    ///
    /// A failure on one issue is recorded in its result and the session carries on. Only a
    /// failure to obtain the issue list aborts the session, which is then kept as `Failed`.
    ///
    /// # Errors
    /// Returns `IntegrityError::Session` when the issue scan fails.
    pub fn start_repair_session(&self, dry_run: bool) -> Result<RepairSession, IntegrityError> {
        let mut session = RepairSession::start(dry_run);
        self.counters.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.publish(&session);
        info!(session_id = %session.id, dry_run, "repair session started");

        let issues = match self.monitor.find_integrity_issues() {
            Ok(issues) => issues,
            Err(err) => {
                let message = err.to_string();
                session.status = SessionStatus::Failed;
                session.error = Some(message.clone());
                session.end_time = Some(OffsetDateTime::now_utc());
                self.publish(&session);
                self.counters.sessions_failed.fetch_add(1, Ordering::Relaxed);
                error!(session_id = %session.id, error = %message, "repair session failed");
                return Err(IntegrityError::Session { session_id: session.id, message });
            }
        };

        for issue in issues {
            let result = self.repair_issue(issue, dry_run);
            if !result.success {
                warn!(
                    session_id = %session.id,
                    record_id = %result.issue.record_id,
                    issue_type = %result.issue.issue_type,
                    action = %result.action,
                    error = result.error.as_deref().unwrap_or_default(),
                    "issue not repaired"
                );
            }
            session.results.push(result);
        }

        session.status = SessionStatus::Completed;
        session.end_time = Some(OffsetDateTime::now_utc());
        self.publish(&session);
        info!(
            session_id = %session.id,
            dry_run,
            issues = session.results.len(),
            successful = session.count_successful(),
            "repair session completed"
        );
        Ok(session)
    }

    /// Undo a finished session's mutations, newest first.
    ///
    /// Returns `false` without touching the store when the session is unknown or has nothing
    /// to undo. Individual undo failures are logged and counted; the session still ends
    /// `RolledBack`.
    pub fn rollback_session(&self, session_id: &str) -> bool {
        let results = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(session_id) else {
                debug!(session_id, "rollback requested for unknown session");
                return false;
            };
            if !session.can_roll_back() {
                info!(
                    session_id,
                    status = ?session.status,
                    dry_run = session.dry_run,
                    "session has nothing to roll back"
                );
                return false;
            }
            session.status = SessionStatus::RolledBack;
            session.results.clone()
        };

        let mut restored = 0_usize;
        let mut failed = 0_usize;
        for result in results.iter().rev().filter(|result| result.rollback_available) {
            let Some(snapshot) = result.rollback_data.as_ref() else {
                continue;
            };
            match self.undo(snapshot) {
                Ok(()) => restored += 1,
                Err(err) => {
                    failed += 1;
                    self.counters.rollback_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        session_id,
                        record_id = %result.issue.record_id,
                        error = %err,
                        "failed to roll back repair"
                    );
                }
            }
        }

        self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
        info!(session_id, restored, failed, "repair session rolled back");
        true
    }

    #[must_use]
    pub fn get_session(&self, session_id: &str) -> Option<RepairSession> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// All retained sessions, newest first.
    #[must_use]
    pub fn list_sessions(&self) -> Vec<RepairSession> {
        let mut sessions = self.sessions.lock().values().cloned().collect::<Vec<_>>();
        sessions.sort_by(|a, b| {
            b.start_time.cmp(&a.start_time).then_with(|| b.id.cmp(&a.id))
        });
        sessions
    }

    #[must_use]
    pub fn stats(&self) -> RepairStats {
        RepairStats {
            sessions_started: self.counters.sessions_started.load(Ordering::Relaxed),
            sessions_failed: self.counters.sessions_failed.load(Ordering::Relaxed),
            rollbacks: self.counters.rollbacks.load(Ordering::Relaxed),
            rollback_failures: self.counters.rollback_failures.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, session: &RepairSession) {
        let mut sessions = self.sessions.lock();
        sessions.insert(session.id.clone(), session.clone());
        while sessions.len() > self.max_sessions {
            let oldest = sessions
                .values()
                .filter(|candidate| candidate.id != session.id)
                .min_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)))
                .map(|candidate| candidate.id.clone());
            let Some(oldest) = oldest else {
                break;
            };
            sessions.remove(&oldest);
            debug!(session_id = %oldest, "evicted repair session from history");
        }
    }

    fn repair_issue(&self, issue: IntegrityIssue, dry_run: bool) -> RepairResult {
        let attempt = match issue.issue_type {
            IssueType::OrphanEdge => self.repair_orphan_edge(&issue, dry_run),
            IssueType::InvalidData => self.repair_invalid_data(&issue, dry_run),
            IssueType::Duplicate => Ok(RepairResult::reported_only(
                issue.clone(),
                "duplicate records require manual review",
            )),
            IssueType::MissingReference => Ok(RepairResult::reported_only(
                issue.clone(),
                "unresolvable reference requires manual review",
            )),
        };
        attempt.unwrap_or_else(|err| RepairResult::failed(issue, err.to_string()))
    }

    fn repair_orphan_edge(
        &self,
        issue: &IntegrityIssue,
        dry_run: bool,
    ) -> Result<RepairResult, StoreError> {
        let store = self.store.as_ref();
        let Some((parent_id, child_id)) = parse_edge_record_id(&issue.record_id) else {
            return Ok(RepairResult::skipped(
                issue.clone(),
                format!("malformed edge record id '{}'", issue.record_id),
            ));
        };

        let Some(edge) = graph::fetch_edge(store, parent_id, child_id)? else {
            return Ok(RepairResult::no_action_needed(issue.clone()));
        };
        if graph::node_exists(store, parent_id)? && graph::node_exists(store, child_id)? {
            return Ok(RepairResult::no_action_needed(issue.clone()));
        }

        let snapshot = RollbackData::OrphanEdge { edge };
        if dry_run {
            return Ok(RepairResult::applied(
                issue.clone(),
                format!("{DRY_RUN_PREFIX}would delete orphan edge {parent_id} -> {child_id}"),
                snapshot,
            ));
        }

        if graph::delete_edge(store, parent_id, child_id)? == 0 {
            return Ok(RepairResult::no_action_needed(issue.clone()));
        }
        Ok(RepairResult::applied(
            issue.clone(),
            format!("DELETED orphan edge {parent_id} -> {child_id}"),
            snapshot,
        ))
    }

    fn repair_invalid_data(
        &self,
        issue: &IntegrityIssue,
        dry_run: bool,
    ) -> Result<RepairResult, StoreError> {
        if !issue.is_missing_title() {
            return Ok(RepairResult::skipped(
                issue.clone(),
                format!(
                    "only missing titles are repaired automatically; manual review required: {}",
                    issue.description
                ),
            ));
        }

        let store = self.store.as_ref();
        let Some(node) = graph::fetch_node(store, &issue.record_id)? else {
            return Ok(RepairResult::no_action_needed(issue.clone()));
        };
        if node.has_title() {
            return Ok(RepairResult::no_action_needed(issue.clone()));
        }

        let placeholder = format!("{PLACEHOLDER_TITLE_PREFIX} {}", node.id);
        let node_id = node.id.clone();
        let snapshot = RollbackData::InvalidData { node };
        if dry_run {
            return Ok(RepairResult::applied(
                issue.clone(),
                format!("{DRY_RUN_PREFIX}would set title of node {node_id} to '{placeholder}'"),
                snapshot,
            ));
        }

        let updated_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| StoreError::Query(format!("failed to format timestamp: {err}")))?;
        if graph::write_title(store, &node_id, Some(&placeholder), &updated_at)? == 0 {
            return Ok(RepairResult::no_action_needed(issue.clone()));
        }
        Ok(RepairResult::applied(
            issue.clone(),
            format!("UPDATED title of node {node_id} to placeholder '{placeholder}'"),
            snapshot,
        ))
    }

    fn undo(&self, snapshot: &RollbackData) -> Result<(), StoreError> {
        let store = self.store.as_ref();
        match snapshot {
            RollbackData::OrphanEdge { edge } => {
                graph::reinsert_edge(store, edge)?;
                Ok(())
            }
            RollbackData::InvalidData { node } => {
                let affected =
                    graph::write_title(store, &node.id, node.title.as_deref(), &node.updated_at)?;
                if affected == 0 {
                    return Err(StoreError::Query(format!(
                        "node {} no longer exists; title not restored",
                        node.id
                    )));
                }
                Ok(())
            }
        }
    }
}
