//! Health probes and the integrity scan. Nothing in this module mutates the store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use graph_integrity_core::{
    edge_record_id, GraphNode, HealthCheckResult, IntegrityError, IntegrityIssue, IssueType,
    ProbeOutcome, RelationalStore, Severity, StoreError, MISSING_TITLE_DESCRIPTION,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::graph;

pub type ProbeFn = fn(&dyn RelationalStore) -> Result<ProbeVerdict, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeVerdict {
    pub passed: bool,
    pub message: String,
}

impl ProbeVerdict {
    pub fn pass(message: impl Into<String>) -> Self {
        Self { passed: true, message: message.into() }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { passed: false, message: message.into() }
    }
}

/// One bounded check. A failing critical probe makes the whole result unhealthy.
#[derive(Debug, Clone, Copy)]
pub struct HealthProbe {
    pub name: &'static str,
    pub critical: bool,
    pub check: ProbeFn,
}

#[must_use]
pub fn default_probes() -> Vec<HealthProbe> {
    vec![
        HealthProbe { name: "connectivity", critical: true, check: probe_connectivity },
        HealthProbe { name: "schema", critical: true, check: probe_schema },
        HealthProbe { name: "orphan_edges", critical: false, check: probe_orphan_edges },
        HealthProbe { name: "missing_titles", critical: false, check: probe_missing_titles },
        HealthProbe {
            name: "dangling_references",
            critical: false,
            check: probe_dangling_references,
        },
        HealthProbe { name: "storage_integrity", critical: false, check: probe_storage_integrity },
    ]
}

fn probe_connectivity(store: &dyn RelationalStore) -> Result<ProbeVerdict, StoreError> {
    match store.query_one("SELECT 1 AS ok", &[])? {
        Some(row) if row.i64("ok")? == 1 => Ok(ProbeVerdict::pass("store reachable")),
        _ => Ok(ProbeVerdict::fail("store returned no row for SELECT 1")),
    }
}

fn probe_schema(store: &dyn RelationalStore) -> Result<ProbeVerdict, StoreError> {
    let rows = store.query_all(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('nodes', 'edges')",
        &[],
    )?;
    let present = rows.iter().map(|row| row.text("name")).collect::<Result<HashSet<_>, _>>()?;
    let missing = ["nodes", "edges"]
        .into_iter()
        .filter(|table| !present.contains(*table))
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(ProbeVerdict::pass("graph tables present"))
    } else {
        Ok(ProbeVerdict::fail(format!("missing tables: {}", missing.join(", "))))
    }
}

fn probe_orphan_edges(store: &dyn RelationalStore) -> Result<ProbeVerdict, StoreError> {
    let n = graph::count(
        store,
        "SELECT COUNT(*) AS n FROM edges e
         WHERE NOT EXISTS (SELECT 1 FROM nodes p WHERE p.id = e.parent_id)
            OR NOT EXISTS (SELECT 1 FROM nodes c WHERE c.id = e.child_id)",
    )?;
    Ok(count_verdict(n, "orphan edges"))
}

fn probe_missing_titles(store: &dyn RelationalStore) -> Result<ProbeVerdict, StoreError> {
    let n = graph::count(
        store,
        "SELECT COUNT(*) AS n FROM nodes WHERE title IS NULL OR TRIM(title) = ''",
    )?;
    Ok(count_verdict(n, "nodes without a title"))
}

fn probe_dangling_references(store: &dyn RelationalStore) -> Result<ProbeVerdict, StoreError> {
    let n = graph::count(
        store,
        "SELECT COUNT(*) AS n FROM nodes n
         WHERE (n.parent_id IS NOT NULL
                AND NOT EXISTS (SELECT 1 FROM nodes p WHERE p.id = n.parent_id))
            OR (n.prev_sibling_id IS NOT NULL
                AND NOT EXISTS (SELECT 1 FROM nodes s WHERE s.id = n.prev_sibling_id))",
    )?;
    Ok(count_verdict(n, "nodes with unresolvable references"))
}

fn probe_storage_integrity(store: &dyn RelationalStore) -> Result<ProbeVerdict, StoreError> {
    let rows = store.query_all("PRAGMA quick_check", &[])?;
    let messages = rows
        .iter()
        .filter_map(|row| row.values().next().map(ToString::to_string))
        .collect::<Vec<_>>();
    if messages.len() == 1 && messages[0] == "ok" {
        Ok(ProbeVerdict::pass("quick_check ok"))
    } else {
        Ok(ProbeVerdict::fail(format!("quick_check reported: {}", messages.join("; "))))
    }
}

fn count_verdict(n: i64, what: &str) -> ProbeVerdict {
    if n == 0 {
        ProbeVerdict::pass(format!("no {what}"))
    } else {
        ProbeVerdict::fail(format!("{n} {what}"))
    }
}

pub struct HealthMonitor {
    store: Arc<dyn RelationalStore>,
    probes: Vec<HealthProbe>,
    probe_timeout: Duration,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(store: Arc<dyn RelationalStore>, config: &MonitorConfig) -> Self {
        Self { store, probes: default_probes(), probe_timeout: config.probe_timeout() }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: HealthProbe) -> Self {
        self.probes.push(probe);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RelationalStore> {
        &self.store
    }

    /// Run every probe concurrently, each under its own timeout.
    ///
    /// Probe errors, panics, and timeouts are recorded as failed outcomes; this never fails.
    pub async fn run_health_checks(&self) -> HealthCheckResult {
        let handles = self
            .probes
            .iter()
            .map(|probe| {
                let store = Arc::clone(&self.store);
                let probe = *probe;
                let timeout = self.probe_timeout;
                (probe, tokio::spawn(run_probe(store, probe, timeout)))
            })
            .collect::<Vec<_>>();

        let mut checks = Vec::with_capacity(handles.len());
        for (probe, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(err) => ProbeOutcome {
                    name: probe.name.to_string(),
                    critical: probe.critical,
                    passed: false,
                    timed_out: false,
                    message: format!("probe task failed: {err}"),
                    duration_ms: 0,
                },
            };
            checks.push(outcome);
        }

        let result = HealthCheckResult::from_checks(checks, OffsetDateTime::now_utc());
        info!(
            status = %result.status,
            failed = result.failed_checks().count(),
            "health checks complete"
        );
        result
    }

    /// Full scan of the graph store.
    ///
    /// # Errors
    /// Returns `IntegrityError::Scan` when the store cannot be read.
    pub fn find_integrity_issues(&self) -> Result<Vec<IntegrityIssue>, IntegrityError> {
        let store = self.store.as_ref();
        let orphans = graph::list_orphan_edges(store).map_err(IntegrityError::Scan)?;
        let nodes = graph::list_nodes(store).map_err(IntegrityError::Scan)?;

        let mut issues = Vec::new();
        for orphan in orphans {
            let (severity, which) = match (orphan.parent_missing, orphan.child_missing) {
                (true, true) => (Severity::High, "parent and child"),
                (true, false) => (Severity::Medium, "parent"),
                _ => (Severity::Medium, "child"),
            };
            issues.push(IntegrityIssue::new(
                IssueType::OrphanEdge,
                edge_record_id(&orphan.parent_id, &orphan.child_id),
                format!(
                    "Edge {} -> {} references missing {which} node",
                    orphan.parent_id, orphan.child_id
                ),
                severity,
            ));
        }
        classify_nodes(&nodes, &mut issues);

        let mut by_type: HashMap<IssueType, usize> = HashMap::new();
        for issue in &issues {
            *by_type.entry(issue.issue_type).or_default() += 1;
        }
        info!(total = issues.len(), ?by_type, "integrity scan complete");
        Ok(issues)
    }
}

async fn run_probe(
    store: Arc<dyn RelationalStore>,
    probe: HealthProbe,
    timeout: Duration,
) -> ProbeOutcome {
    let started = Instant::now();
    let task = tokio::task::spawn_blocking(move || (probe.check)(store.as_ref()));

    let (passed, timed_out, message) = match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(verdict))) => (verdict.passed, false, verdict.message),
        Ok(Ok(Err(err))) => (false, false, format!("probe error: {err}")),
        Ok(Err(err)) => (false, false, format!("probe panicked: {err}")),
        Err(_) => (false, true, format!("probe timed out after {} ms", timeout.as_millis())),
    };

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    if passed {
        debug!(probe = probe.name, duration_ms, "health probe passed");
    } else {
        warn!(
            probe = probe.name,
            critical = probe.critical,
            timed_out,
            %message,
            "health probe failed"
        );
    }

    ProbeOutcome {
        name: probe.name.to_string(),
        critical: probe.critical,
        passed,
        timed_out,
        message,
        duration_ms,
    }
}

fn classify_nodes(nodes: &[GraphNode], issues: &mut Vec<IntegrityIssue>) {
    let ids = nodes.iter().map(|node| node.id.as_str()).collect::<HashSet<_>>();

    for node in nodes {
        if !node.has_title() {
            issues.push(IntegrityIssue::new(
                IssueType::InvalidData,
                &node.id,
                MISSING_TITLE_DESCRIPTION,
                Severity::Low,
            ));
        }

        match node.parent_id.as_deref() {
            Some(parent) if parent == node.id => issues.push(IntegrityIssue::new(
                IssueType::MissingReference,
                &node.id,
                format!("Node {} lists itself as parent", node.id),
                Severity::Medium,
            )),
            Some(parent) if !ids.contains(parent) => issues.push(IntegrityIssue::new(
                IssueType::MissingReference,
                &node.id,
                format!("Node {} references missing parent {parent}", node.id),
                Severity::High,
            )),
            _ => {}
        }

        match node.prev_sibling_id.as_deref() {
            Some(sibling) if sibling == node.id => issues.push(IntegrityIssue::new(
                IssueType::MissingReference,
                &node.id,
                format!("Node {} lists itself as previous sibling", node.id),
                Severity::Medium,
            )),
            Some(sibling) if !ids.contains(sibling) => issues.push(IntegrityIssue::new(
                IssueType::MissingReference,
                &node.id,
                format!("Node {} references missing sibling {sibling}", node.id),
                Severity::Medium,
            )),
            _ => {}
        }
    }

    // Uniqueness rule: one titled node per (parent, type, normalized title).
    let mut groups: HashMap<(Option<&str>, &str, String), Vec<&GraphNode>> = HashMap::new();
    for node in nodes.iter().filter(|node| node.has_title()) {
        let title = node.title.as_deref().unwrap_or_default().trim().to_lowercase();
        groups
            .entry((node.parent_id.as_deref(), node.node_type.as_str(), title))
            .or_default()
            .push(node);
    }

    let mut duplicates = groups.into_values().filter(|group| group.len() > 1).collect::<Vec<_>>();
    for group in &mut duplicates {
        group.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    }
    duplicates.sort_by(|a, b| a[0].id.cmp(&b[0].id));

    for group in duplicates {
        let representative = group[0];
        let others = group[1..].iter().map(|node| node.id.as_str()).collect::<Vec<_>>();
        issues.push(IntegrityIssue::new(
            IssueType::Duplicate,
            &representative.id,
            format!(
                "Duplicate of '{}' under {}: also {}",
                representative.title.as_deref().unwrap_or_default().trim(),
                representative.parent_id.as_deref().unwrap_or("<root>"),
                others.join(", ")
            ),
            Severity::Low,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, title: Option<&str>, parent_id: Option<&str>) -> GraphNode {
        GraphNode {
            id: id.to_string(),
            title: title.map(str::to_string),
            node_type: "topic".to_string(),
            parent_id: parent_id.map(str::to_string),
            prev_sibling_id: None,
            created_at: format!("2026-01-01T00:00:0{}Z", id.len() % 10),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn classify_flags_missing_titles_and_references() {
        let nodes = vec![
            node("root", Some("Root"), None),
            node("n3", Some("  "), Some("root")),
            node("n4", Some("Lost"), Some("gone")),
            node("n5", Some("Me"), Some("n5")),
        ];
        let mut issues = Vec::new();
        classify_nodes(&nodes, &mut issues);

        assert!(issues.iter().any(|issue| issue.is_missing_title() && issue.record_id == "n3"));
        assert!(issues.iter().any(|issue| issue.issue_type == IssueType::MissingReference
            && issue.record_id == "n4"
            && issue.description.contains("gone")));
        assert!(issues.iter().any(|issue| issue.issue_type == IssueType::MissingReference
            && issue.record_id == "n5"
            && issue.description.contains("itself")));
        assert!(!issues.iter().any(|issue| issue.record_id == "root"));
        // Only the missing-title case is ever classified as invalid data.
        assert!(issues
            .iter()
            .filter(|issue| issue.issue_type == IssueType::InvalidData)
            .all(IntegrityIssue::is_missing_title));
    }

    #[test]
    fn duplicates_pick_earliest_record_as_representative() {
        let mut first = node("a1", Some("Design"), Some("root"));
        first.created_at = "2026-01-01T00:00:00Z".to_string();
        let mut second = node("a0", Some(" design "), Some("root"));
        second.created_at = "2026-02-01T00:00:00Z".to_string();
        let other_parent = node("a2", Some("Design"), Some("elsewhere"));
        let nodes = vec![node("root", Some("Root"), None), first, second, other_parent];

        let mut issues = Vec::new();
        classify_nodes(&nodes, &mut issues);
        let duplicates = issues
            .iter()
            .filter(|issue| issue.issue_type == IssueType::Duplicate)
            .collect::<Vec<_>>();
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].record_id, "a1");
        assert!(duplicates[0].description.contains("a0"));
        assert!(!duplicates[0].description.contains("a2"));
    }

    #[test]
    fn self_sibling_is_a_missing_reference() {
        let mut looped = node("s1", Some("Loop"), None);
        looped.prev_sibling_id = Some("s1".to_string());
        let mut issues = Vec::new();
        classify_nodes(&[looped], &mut issues);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, IssueType::MissingReference);
        assert_eq!(issues[0].severity, Severity::Medium);
    }
}
