use std::path::Path;

use anyhow::{anyhow, Context, Result};
use graph_integrity_core::{
    GraphEdge, GraphNode, MutationOutcome, RelationalStore, Row, SqlValue, StoreError,
};
use parking_lot::Mutex;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// No foreign keys: the store has to be able to hold the inconsistencies the
// integrity scan is looking for.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS nodes (
  id TEXT PRIMARY KEY,
  title TEXT,
  node_type TEXT NOT NULL DEFAULT 'node',
  parent_id TEXT,
  prev_sibling_id TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS edges (
  parent_id TEXT NOT NULL,
  child_id TEXT NOT NULL,
  weight REAL NOT NULL DEFAULT 1.0,
  relationship_type TEXT NOT NULL DEFAULT 'contains',
  created_at TEXT NOT NULL,
  PRIMARY KEY (parent_id, child_id)
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id);
CREATE INDEX IF NOT EXISTS idx_nodes_prev_sibling ON nodes(prev_sibling_id);
CREATE INDEX IF NOT EXISTS idx_edges_child ON edges(child_id);
";

/// SQLite-backed graph store shared by the monitor, the repair engine, and fixtures.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed graph store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open a private in-memory store.
    ///
    /// # Errors
    /// Returns an error when SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.conn.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&conn)?;

        if version < 1 {
            apply_migration(&mut conn, 1, MIGRATION_001_SQL)?;
            version = 1;
        }

        if version < 2 {
            apply_migration(&mut conn, 2, MIGRATION_002_SQL)?;
            version = current_schema_version(&conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// # Errors
    /// Returns an error when the insert fails, including on a duplicate id.
    pub fn insert_node(&self, node: &GraphNode) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO nodes(id, title, node_type, parent_id, prev_sibling_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    node.id,
                    node.title,
                    node.node_type,
                    node.parent_id,
                    node.prev_sibling_id,
                    node.created_at,
                    node.updated_at,
                ],
            )
            .with_context(|| format!("failed to insert node {}", node.id))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the insert fails, including on a duplicate `(parent, child)` pair.
    pub fn insert_edge(&self, edge: &GraphEdge) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO edges(parent_id, child_id, weight, relationship_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    edge.parent_id,
                    edge.child_id,
                    edge.weight,
                    edge.relationship_type,
                    edge.created_at,
                ],
            )
            .with_context(|| {
                format!("failed to insert edge {} -> {}", edge.parent_id, edge.child_id)
            })?;
        Ok(())
    }

    /// Delete a node row only; edges that reference it are left behind.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_node(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .lock()
            .execute("DELETE FROM nodes WHERE id = ?1", params![id])
            .with_context(|| format!("failed to delete node {id}"))?;
        Ok(affected > 0)
    }

    /// # Errors
    /// Returns an error when the row cannot be read.
    pub fn get_node(&self, id: &str) -> Result<Option<GraphNode>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, title, node_type, parent_id, prev_sibling_id, created_at, updated_at
                 FROM nodes WHERE id = ?1",
                params![id],
                node_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load node {id}"))
    }

    /// # Errors
    /// Returns an error when the row cannot be read.
    pub fn get_edge(&self, parent_id: &str, child_id: &str) -> Result<Option<GraphEdge>> {
        self.conn
            .lock()
            .query_row(
                "SELECT parent_id, child_id, weight, relationship_type, created_at
                 FROM edges WHERE parent_id = ?1 AND child_id = ?2",
                params![parent_id, child_id],
                edge_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load edge {parent_id} -> {child_id}"))
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_nodes(&self) -> Result<Vec<GraphNode>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, node_type, parent_id, prev_sibling_id, created_at, updated_at
             FROM nodes ORDER BY id ASC",
        )?;
        let nodes = stmt.query_map([], node_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_edges(&self) -> Result<Vec<GraphEdge>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT parent_id, child_id, weight, relationship_type, created_at
             FROM edges ORDER BY parent_id ASC, child_id ASC",
        )?;
        let edges = stmt.query_map([], edge_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }
}

impl RelationalStore for SqliteStore {
    fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(query_error)?;
        let columns = column_names(&stmt);
        let mut rows = stmt.query(params_from_iter(bind(params))).map_err(query_error)?;
        match rows.next().map_err(query_error)? {
            Some(row) => Ok(Some(collect_row(row, &columns).map_err(query_error)?)),
            None => Ok(None),
        }
    }

    fn query_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(query_error)?;
        let columns = column_names(&stmt);
        let mut rows = stmt.query(params_from_iter(bind(params))).map_err(query_error)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(query_error)? {
            out.push(collect_row(row, &columns).map_err(query_error)?);
        }
        Ok(out)
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<MutationOutcome, StoreError> {
        let conn = self.conn.lock();
        let before = conn.last_insert_rowid();
        let affected_rows =
            conn.execute(sql, params_from_iter(bind(params))).map_err(query_error)?;
        let after = conn.last_insert_rowid();
        // A deleted maximum rowid can be handed out again, leaving the value unchanged.
        let inserted = after != before || (affected_rows > 0 && is_insert(sql));
        let last_insert_id = (inserted && after != 0).then_some(after);
        Ok(MutationOutcome { affected_rows, last_insert_id })
    }
}

fn is_insert(sql: &str) -> bool {
    let verb = sql.split_whitespace().next().unwrap_or_default();
    verb.eq_ignore_ascii_case("INSERT") || verb.eq_ignore_ascii_case("REPLACE")
}

fn query_error(err: rusqlite::Error) -> StoreError {
    StoreError::Query(err.to_string())
}

fn bind(params: &[SqlValue]) -> Vec<Value> {
    params
        .iter()
        .map(|param| match param {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(value) => Value::Integer(*value),
            SqlValue::Real(value) => Value::Real(*value),
            SqlValue::Text(value) => Value::Text(value.clone()),
            SqlValue::Blob(bytes) => Value::Blob(bytes.clone()),
        })
        .collect()
}

fn column_names(stmt: &rusqlite::Statement<'_>) -> Vec<String> {
    stmt.column_names().into_iter().map(str::to_string).collect()
}

fn collect_row(row: &rusqlite::Row<'_>, columns: &[String]) -> rusqlite::Result<Row> {
    let mut out = Row::new();
    for (idx, name) in columns.iter().enumerate() {
        let value = match row.get_ref(idx)? {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(value) => SqlValue::Integer(value),
            ValueRef::Real(value) => SqlValue::Real(value),
            ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
        };
        out.insert(name.clone(), value);
    }
    Ok(out)
}

fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphNode> {
    Ok(GraphNode {
        id: row.get(0)?,
        title: row.get(1)?,
        node_type: row.get(2)?,
        parent_id: row.get(3)?,
        prev_sibling_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn edge_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphEdge> {
    Ok(GraphEdge {
        parent_id: row.get(0)?,
        child_id: row.get(1)?,
        weight: row.get(2)?,
        relationship_type: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn apply_migration(conn: &mut Connection, version: i64, sql: &str) -> Result<()> {
    let tx = conn
        .transaction()
        .with_context(|| format!("failed to start migration v{version} transaction"))?;
    tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read schema version")?;
    Ok(version.unwrap_or(0))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format timestamp")
}
