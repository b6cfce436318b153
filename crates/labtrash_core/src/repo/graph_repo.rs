//! Relationship graph contracts and SQLite implementation.
//!
//! # Invariants
//! - Edge endpoints always reference stored entities (foreign keys).
//! - Edges are returned regardless of endpoint state; visibility is derived
//!   from the child's tombstone state by callers.
//! - Listing order is deterministic: counterpart `tech_id ASC`, then kind.

use crate::model::edge::{EdgeKind, RelationshipEdge};
use crate::model::entity::TechId;
use crate::repo::{RepoError, RepoResult};
use rusqlite::{params, Connection, Row};

/// Repository interface for ownership edges.
pub trait GraphRepository {
    /// Inserts one edge. Returns `false` when it already existed.
    fn add_edge(&self, edge: &RelationshipEdge) -> RepoResult<bool>;
    /// Removes one edge. Returns `false` when it did not exist.
    fn remove_edge(&self, edge: &RelationshipEdge) -> RepoResult<bool>;
    /// Edges whose parent is `parent`.
    fn edges_from(&self, parent: TechId) -> RepoResult<Vec<RelationshipEdge>>;
    /// Edges whose child is `child`.
    fn edges_to(&self, child: TechId) -> RepoResult<Vec<RelationshipEdge>>;
}

/// SQLite-backed relationship graph.
pub struct SqliteGraphRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteGraphRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl GraphRepository for SqliteGraphRepository<'_> {
    fn add_edge(&self, edge: &RelationshipEdge) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO entity_edges (child_tech_id, parent_tech_id, kind)
             VALUES (?1, ?2, ?3);",
            params![edge.child, edge.parent, edge.kind.as_str()],
        )?;
        Ok(changed == 1)
    }

    fn remove_edge(&self, edge: &RelationshipEdge) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM entity_edges
             WHERE child_tech_id = ?1
               AND parent_tech_id = ?2
               AND kind = ?3;",
            params![edge.child, edge.parent, edge.kind.as_str()],
        )?;
        Ok(changed == 1)
    }

    fn edges_from(&self, parent: TechId) -> RepoResult<Vec<RelationshipEdge>> {
        let mut stmt = self.conn.prepare(
            "SELECT child_tech_id, parent_tech_id, kind
             FROM entity_edges
             WHERE parent_tech_id = ?1
             ORDER BY child_tech_id ASC, kind ASC;",
        )?;
        let mut rows = stmt.query([parent])?;
        let mut edges = Vec::new();
        while let Some(row) = rows.next()? {
            edges.push(parse_edge_row(row)?);
        }
        Ok(edges)
    }

    fn edges_to(&self, child: TechId) -> RepoResult<Vec<RelationshipEdge>> {
        let mut stmt = self.conn.prepare(
            "SELECT child_tech_id, parent_tech_id, kind
             FROM entity_edges
             WHERE child_tech_id = ?1
             ORDER BY parent_tech_id ASC, kind ASC;",
        )?;
        let mut rows = stmt.query([child])?;
        let mut edges = Vec::new();
        while let Some(row) = rows.next()? {
            edges.push(parse_edge_row(row)?);
        }
        Ok(edges)
    }
}

fn parse_edge_row(row: &Row<'_>) -> RepoResult<RelationshipEdge> {
    let kind_text: String = row.get(2)?;
    let kind = EdgeKind::parse(&kind_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid edge kind `{kind_text}` in entity_edges.kind"))
    })?;
    Ok(RelationshipEdge {
        child: row.get(0)?,
        parent: row.get(1)?,
        kind,
    })
}
