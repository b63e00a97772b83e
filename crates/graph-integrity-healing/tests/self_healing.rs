use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use graph_integrity_core::{
    GraphEdge, GraphNode, HealthStatus, IntegrityIssue, IssueType, RelationalStore, SessionStatus,
    StoreError, TaskType, ACTION_NO_ACTION_NEEDED, ACTION_REPORTED_ONLY, PLACEHOLDER_TITLE_PREFIX,
};
use graph_integrity_healing::{
    HealingConfig, HealingRuntime, HealthMonitor, HealthProbe, JsonlReportSink, ManualClock,
    MonitorConfig, ProbeVerdict, RepairConfig, RepairEngine,
};
use graph_integrity_store_sqlite::SqliteStore;
use proptest::prelude::*;
use time::macros::datetime;

const CREATED: &str = "2026-01-01T00:00:00Z";

fn node(id: &str, title: Option<&str>) -> GraphNode {
    GraphNode {
        id: id.to_string(),
        title: title.map(str::to_string),
        node_type: "topic".to_string(),
        parent_id: None,
        prev_sibling_id: None,
        created_at: CREATED.to_string(),
        updated_at: CREATED.to_string(),
    }
}

fn edge(parent_id: &str, child_id: &str, weight: f64) -> GraphEdge {
    GraphEdge {
        parent_id: parent_id.to_string(),
        child_id: child_id.to_string(),
        weight,
        relationship_type: "related".to_string(),
        created_at: CREATED.to_string(),
    }
}

fn open_store() -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open_in_memory()?;
    store.migrate()?;
    Ok(Arc::new(store))
}

fn engine_for(store: &Arc<SqliteStore>) -> RepairEngine {
    let monitor = Arc::new(HealthMonitor::new(store.clone(), &MonitorConfig::default()));
    RepairEngine::new(monitor, &RepairConfig::default())
}

fn monitor_for(store: &Arc<SqliteStore>) -> HealthMonitor {
    HealthMonitor::new(store.clone(), &MonitorConfig::default())
}

fn snapshot(store: &SqliteStore) -> Result<(Vec<GraphNode>, Vec<GraphEdge>)> {
    Ok((store.list_nodes()?, store.list_edges()?))
}

fn issue_set(monitor: &HealthMonitor) -> Result<HashSet<IntegrityIssue>> {
    Ok(monitor.find_integrity_issues()?.into_iter().collect())
}

#[test]
fn orphan_edge_is_detected_and_deleted() -> Result<()> {
    let store = open_store()?;
    store.insert_node(&node("n1", Some("One")))?;
    store.insert_node(&node("n2", Some("Two")))?;
    store.insert_edge(&edge("n1", "n2", 0.7))?;
    store.delete_node("n2")?;

    let monitor = monitor_for(&store);
    let issues = monitor.find_integrity_issues()?;
    assert!(issues
        .iter()
        .any(|issue| issue.issue_type == IssueType::OrphanEdge && issue.record_id == "n1->n2"));

    let session = engine_for(&store).start_repair_session(false)?;
    assert_eq!(session.status, SessionStatus::Completed);
    let Some(result) = session.results.iter().find(|result| result.issue.record_id == "n1->n2")
    else {
        return Err(anyhow!("no result for n1->n2"));
    };
    assert!(result.success);
    assert!(result.rollback_available);
    assert!(result.action.contains("DELETED orphan edge n1 -> n2"));

    assert!(store.get_edge("n1", "n2")?.is_none());
    assert!(!monitor.find_integrity_issues()?.iter().any(|issue| issue.record_id == "n1->n2"));
    Ok(())
}

#[test]
fn missing_title_gets_placeholder_and_is_no_longer_flagged() -> Result<()> {
    let store = open_store()?;
    store.insert_node(&node("n3", Some("")))?;

    let session = engine_for(&store).start_repair_session(false)?;
    assert_eq!(session.results.len(), 1);
    assert!(session.results[0].success);

    let Some(repaired) = store.get_node("n3")? else {
        return Err(anyhow!("node n3 disappeared"));
    };
    let title = repaired.title.unwrap_or_default();
    assert!(title.starts_with(PLACEHOLDER_TITLE_PREFIX));
    assert!(title.contains("n3"));
    assert_ne!(repaired.updated_at, CREATED);

    let rescanned = monitor_for(&store).find_integrity_issues()?;
    assert!(!rescanned.iter().any(|issue| issue.record_id == "n3"));
    Ok(())
}

#[test]
fn concurrent_sessions_complete_with_distinct_ids() -> Result<()> {
    let store = open_store()?;
    store.insert_node(&node("n1", Some("One")))?;
    store.insert_edge(&edge("n1", "ghost", 1.0))?;
    store.insert_node(&node("untitled", None))?;
    let engine = engine_for(&store);

    let (manual, scheduled) = thread::scope(|scope| {
        let manual = scope.spawn(|| engine.start_repair_session(false));
        let scheduled = scope.spawn(|| engine.start_repair_session(true));
        (manual.join(), scheduled.join())
    });
    let manual = manual.map_err(|_| anyhow!("manual session thread panicked"))??;
    let scheduled = scheduled.map_err(|_| anyhow!("scheduled session thread panicked"))??;

    assert_ne!(manual.id, scheduled.id);
    for session in [&manual, &scheduled] {
        assert_eq!(session.status, SessionStatus::Completed);
        let Some(stored) = engine.get_session(&session.id) else {
            return Err(anyhow!("session {} not retained", session.id));
        };
        assert_eq!(stored.id, session.id);
    }
    assert_eq!(engine.list_sessions().len(), 2);
    Ok(())
}

#[tokio::test]
async fn nightly_fires_only_in_configured_hour() -> Result<()> {
    let store = open_store()?;
    let dir = tempfile::tempdir()?;
    let report_path = dir.path().join("reports.jsonl");
    let config = HealingConfig::from_yaml_str(
        "schedule:\n  nightly_check_hour: 3\n  weekly_deep_analysis_enabled: false\n",
    )?;
    let clock = Arc::new(ManualClock::new(datetime!(2026-10-14 03:15 UTC)));
    let runtime = HealingRuntime::new(
        store,
        &config,
        Arc::new(JsonlReportSink::new(report_path.clone())),
        clock.clone(),
    )?;

    let ran = runtime.scheduler.check_scheduled_tasks().await;
    assert_eq!(ran.len(), 1);
    assert_eq!(ran[0].task_type, TaskType::Nightly);

    clock.set(datetime!(2026-10-14 04:15 UTC));
    assert!(runtime.scheduler.check_scheduled_tasks().await.is_empty());
    assert_eq!(runtime.scheduler.get_scheduled_tasks().len(), 1);

    let lines = fs::read_to_string(&report_path)?;
    assert_eq!(lines.lines().count(), 1);
    let status = runtime.scheduler.get_status();
    assert_eq!(status.last_nightly_run, Some(datetime!(2026-10-14 03:15 UTC)));
    assert_eq!(status.next_nightly_run, Some(datetime!(2026-10-15 03:00 UTC)));
    assert_eq!(status.next_weekly_run, None);
    Ok(())
}

#[test]
fn rollback_of_unknown_session_changes_nothing() -> Result<()> {
    let store = open_store()?;
    store.insert_node(&node("n1", None))?;
    store.insert_edge(&edge("n1", "ghost", 1.0))?;
    let engine = engine_for(&store);

    let before = snapshot(&store)?;
    assert!(!engine.rollback_session("unknown-id"));
    assert_eq!(snapshot(&store)?, before);
    assert_eq!(engine.stats().rollbacks, 0);
    Ok(())
}

#[test]
fn rollback_restores_records_field_for_field() -> Result<()> {
    let store = open_store()?;
    store.insert_node(&node("a", Some("Alpha")))?;
    store.insert_node(&node("blank", Some("   ")))?;
    store.insert_edge(&GraphEdge {
        parent_id: "a".to_string(),
        child_id: "ghost".to_string(),
        weight: 0.25,
        relationship_type: "references".to_string(),
        created_at: "2025-12-24T10:30:00Z".to_string(),
    })?;
    store.insert_edge(&edge("ghost", "blank", 2.0))?;
    let before = snapshot(&store)?;

    let engine = engine_for(&store);
    let session = engine.start_repair_session(false)?;
    assert_eq!(session.results.iter().filter(|result| result.rollback_available).count(), 3);
    assert_ne!(snapshot(&store)?, before);

    assert!(engine.rollback_session(&session.id));
    assert_eq!(snapshot(&store)?, before);
    assert_eq!(
        engine.get_session(&session.id).map(|stored| stored.status),
        Some(SessionStatus::RolledBack)
    );
    Ok(())
}

#[test]
fn unrepairable_issues_are_reported_only() -> Result<()> {
    let store = open_store()?;
    let mut lost = node("lost", Some("Lost"));
    lost.parent_id = Some("gone".to_string());
    store.insert_node(&lost)?;
    let mut looped = node("loop", Some("Loop"));
    looped.parent_id = Some("loop".to_string());
    looped.prev_sibling_id = Some("loop".to_string());
    store.insert_node(&looped)?;
    store.insert_node(&node("twin-a", Some("Twin")))?;
    store.insert_node(&node("twin-b", Some(" twin ")))?;
    let before = snapshot(&store)?;
    let engine = engine_for(&store);

    let session = engine.start_repair_session(false)?;
    let types = session.results.iter().map(|result| result.issue.issue_type).collect::<Vec<_>>();
    assert_eq!(types.iter().filter(|kind| **kind == IssueType::MissingReference).count(), 3);
    assert_eq!(types.iter().filter(|kind| **kind == IssueType::Duplicate).count(), 1);
    assert!(!types.contains(&IssueType::InvalidData));
    for result in &session.results {
        assert!(result.success, "{result:?}");
        assert!(result.action.starts_with(ACTION_REPORTED_ONLY), "{}", result.action);
        assert!(!result.rollback_available);
    }
    assert_eq!(snapshot(&store)?, before);

    let again = engine.start_repair_session(false)?;
    assert_eq!(again.results.len(), session.results.len());
    assert_eq!(again.count_successful(), again.results.len());
    Ok(())
}

fn hanging_check(_store: &dyn RelationalStore) -> Result<ProbeVerdict, StoreError> {
    thread::sleep(Duration::from_millis(300));
    Ok(ProbeVerdict::pass("finished late"))
}

#[tokio::test]
async fn timed_out_check_counts_as_failure() -> Result<()> {
    let store = open_store()?;
    let monitor = HealthMonitor::new(store, &MonitorConfig { probe_timeout_ms: 50 })
        .with_probe(HealthProbe { name: "hanging", critical: true, check: hanging_check });

    let result = monitor.run_health_checks().await;
    assert_eq!(result.status, HealthStatus::Unhealthy);
    let Some(hanging) = result.checks.iter().find(|check| check.name == "hanging") else {
        return Err(anyhow!("hanging check missing from result"));
    };
    assert!(hanging.timed_out);
    assert!(!hanging.passed);
    let others_passed =
        result.checks.iter().filter(|check| check.name != "hanging").all(|check| check.passed);
    assert!(others_passed);
    Ok(())
}

#[derive(Debug, Clone)]
struct GeneratedNode {
    present: bool,
    title: Option<usize>,
    parent: Option<usize>,
    prev_sibling: Option<usize>,
}

#[derive(Debug, Clone)]
struct GeneratedGraph {
    nodes: Vec<GeneratedNode>,
    edges: BTreeSet<(usize, usize)>,
}

const GRAPH_SLOTS: usize = 6;

// Equal after trimming and lowercasing, so siblings drawing both are duplicates.
const TITLE_POOL: [&str; 4] = ["Alpha", " alpha ", "Beta", "  "];

fn generated_node() -> impl Strategy<Value = GeneratedNode> {
    // Pointers may name the node itself, an absent slot, or a slot past the end.
    (
        any::<bool>(),
        prop::option::of(0..TITLE_POOL.len()),
        prop::option::of(0..=GRAPH_SLOTS),
        prop::option::of(0..=GRAPH_SLOTS),
    )
        .prop_map(|(present, title, parent, prev_sibling)| GeneratedNode {
            present,
            title,
            parent,
            prev_sibling,
        })
}

fn generated_graph() -> impl Strategy<Value = GeneratedGraph> {
    (
        prop::collection::vec(generated_node(), GRAPH_SLOTS),
        prop::collection::btree_set((0..GRAPH_SLOTS, 0..GRAPH_SLOTS), 0..10),
    )
        .prop_map(|(nodes, edges)| GeneratedGraph { nodes, edges })
}

fn build(graph: &GeneratedGraph) -> Result<Arc<SqliteStore>> {
    let store = open_store()?;
    for (slot, generated) in graph.nodes.iter().enumerate() {
        if !generated.present {
            continue;
        }
        let mut record = node(&format!("n{slot}"), generated.title.map(|index| TITLE_POOL[index]));
        record.parent_id = generated.parent.map(|target| format!("n{target}"));
        record.prev_sibling_id = generated.prev_sibling.map(|target| format!("n{target}"));
        store.insert_node(&record)?;
    }
    for (parent, child) in &graph.edges {
        store.insert_edge(&edge(&format!("n{parent}"), &format!("n{child}"), 1.0))?;
    }
    Ok(store)
}

fn dry_run_leaves_store_untouched(graph: &GeneratedGraph) -> Result<()> {
    let store = build(graph)?;
    let monitor = monitor_for(&store);
    let before = snapshot(&store)?;
    let issues_before = issue_set(&monitor)?;

    let session = engine_for(&store).start_repair_session(true)?;
    assert!(session
        .results
        .iter()
        .all(|result| !result.rollback_available || result.is_dry_run()));
    assert_eq!(snapshot(&store)?, before);
    assert_eq!(issue_set(&monitor)?, issues_before);
    Ok(())
}

fn second_session_is_a_no_op(graph: &GeneratedGraph) -> Result<()> {
    let store = build(graph)?;
    let engine = engine_for(&store);
    engine.start_repair_session(false)?;
    let after_first = snapshot(&store)?;

    let second = engine.start_repair_session(false)?;
    for result in &second.results {
        assert!(
            result.action == ACTION_NO_ACTION_NEEDED
                || result.action.starts_with(ACTION_REPORTED_ONLY),
            "second session acted on {:?}: {}",
            result.issue,
            result.action
        );
        assert!(result.success);
    }
    assert_eq!(snapshot(&store)?, after_first);
    Ok(())
}

fn repair_then_rollback_round_trips(graph: &GeneratedGraph) -> Result<()> {
    let store = build(graph)?;
    let engine = engine_for(&store);
    let before = snapshot(&store)?;
    let session = engine.start_repair_session(false)?;
    if session.can_roll_back() {
        assert!(engine.rollback_session(&session.id));
    }
    assert_eq!(snapshot(&store)?, before);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn property_dry_run_is_neutral(graph in generated_graph()) {
        let outcome = dry_run_leaves_store_untouched(&graph);
        prop_assert!(outcome.is_ok(), "{:?}", outcome.err());
    }

    #[test]
    fn property_repair_is_idempotent(graph in generated_graph()) {
        let outcome = second_session_is_a_no_op(&graph);
        prop_assert!(outcome.is_ok(), "{:?}", outcome.err());
    }

    #[test]
    fn property_rollback_restores_pre_repair_state(graph in generated_graph()) {
        let outcome = repair_then_rollback_round_trips(&graph);
        prop_assert!(outcome.is_ok(), "{:?}", outcome.err());
    }
}
