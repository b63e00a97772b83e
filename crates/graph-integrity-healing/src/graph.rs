//! Typed graph reads and writes over the relational contract.

use graph_integrity_core::{GraphEdge, GraphNode, RelationalStore, Row, SqlValue, StoreError};

const NODE_COLUMNS: &str = "id, title, node_type, parent_id, prev_sibling_id, created_at, updated_at";
const EDGE_COLUMNS: &str = "parent_id, child_id, weight, relationship_type, created_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OrphanEdgeRow {
    pub parent_id: String,
    pub child_id: String,
    pub parent_missing: bool,
    pub child_missing: bool,
}

fn node_from_row(row: &Row) -> Result<GraphNode, StoreError> {
    Ok(GraphNode {
        id: row.text("id")?,
        title: row.opt_text("title")?,
        node_type: row.text("node_type")?,
        parent_id: row.opt_text("parent_id")?,
        prev_sibling_id: row.opt_text("prev_sibling_id")?,
        created_at: row.text("created_at")?,
        updated_at: row.text("updated_at")?,
    })
}

fn edge_from_row(row: &Row) -> Result<GraphEdge, StoreError> {
    Ok(GraphEdge {
        parent_id: row.text("parent_id")?,
        child_id: row.text("child_id")?,
        weight: row.f64("weight")?,
        relationship_type: row.text("relationship_type")?,
        created_at: row.text("created_at")?,
    })
}

pub(crate) fn fetch_node(
    store: &dyn RelationalStore,
    id: &str,
) -> Result<Option<GraphNode>, StoreError> {
    store
        .query_one(
            &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
            &[SqlValue::from(id)],
        )?
        .as_ref()
        .map(node_from_row)
        .transpose()
}

pub(crate) fn fetch_edge(
    store: &dyn RelationalStore,
    parent_id: &str,
    child_id: &str,
) -> Result<Option<GraphEdge>, StoreError> {
    store
        .query_one(
            &format!("SELECT {EDGE_COLUMNS} FROM edges WHERE parent_id = ?1 AND child_id = ?2"),
            &[SqlValue::from(parent_id), SqlValue::from(child_id)],
        )?
        .as_ref()
        .map(edge_from_row)
        .transpose()
}

pub(crate) fn node_exists(store: &dyn RelationalStore, id: &str) -> Result<bool, StoreError> {
    let row =
        store.query_one("SELECT 1 AS present FROM nodes WHERE id = ?1", &[SqlValue::from(id)])?;
    Ok(row.is_some())
}

pub(crate) fn list_nodes(store: &dyn RelationalStore) -> Result<Vec<GraphNode>, StoreError> {
    store
        .query_all(&format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id ASC"), &[])?
        .iter()
        .map(node_from_row)
        .collect()
}

pub(crate) fn list_orphan_edges(
    store: &dyn RelationalStore,
) -> Result<Vec<OrphanEdgeRow>, StoreError> {
    store
        .query_all(
            "SELECT e.parent_id AS parent_id,
                    e.child_id AS child_id,
                    (p.id IS NULL) AS parent_missing,
                    (c.id IS NULL) AS child_missing
             FROM edges e
             LEFT JOIN nodes p ON p.id = e.parent_id
             LEFT JOIN nodes c ON c.id = e.child_id
             WHERE p.id IS NULL OR c.id IS NULL
             ORDER BY e.parent_id ASC, e.child_id ASC",
            &[],
        )?
        .iter()
        .map(|row| {
            Ok(OrphanEdgeRow {
                parent_id: row.text("parent_id")?,
                child_id: row.text("child_id")?,
                parent_missing: row.i64("parent_missing")? != 0,
                child_missing: row.i64("child_missing")? != 0,
            })
        })
        .collect()
}

pub(crate) fn count(store: &dyn RelationalStore, sql: &str) -> Result<i64, StoreError> {
    match store.query_one(sql, &[])? {
        Some(row) => row.i64("n"),
        None => Ok(0),
    }
}

pub(crate) fn delete_edge(
    store: &dyn RelationalStore,
    parent_id: &str,
    child_id: &str,
) -> Result<usize, StoreError> {
    Ok(store
        .execute(
            "DELETE FROM edges WHERE parent_id = ?1 AND child_id = ?2",
            &[SqlValue::from(parent_id), SqlValue::from(child_id)],
        )?
        .affected_rows)
}

/// Re-insert a previously deleted edge with its original attributes.
pub(crate) fn reinsert_edge(
    store: &dyn RelationalStore,
    edge: &GraphEdge,
) -> Result<usize, StoreError> {
    Ok(store
        .execute(
            &format!(
                "INSERT OR IGNORE INTO edges({EDGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            &[
                SqlValue::from(&edge.parent_id),
                SqlValue::from(&edge.child_id),
                SqlValue::from(edge.weight),
                SqlValue::from(&edge.relationship_type),
                SqlValue::from(&edge.created_at),
            ],
        )?
        .affected_rows)
}

pub(crate) fn write_title(
    store: &dyn RelationalStore,
    id: &str,
    title: Option<&str>,
    updated_at: &str,
) -> Result<usize, StoreError> {
    Ok(store
        .execute(
            "UPDATE nodes SET title = ?1, updated_at = ?2 WHERE id = ?3",
            &[SqlValue::from(title), SqlValue::from(updated_at), SqlValue::from(id)],
        )?
        .affected_rows)
}
