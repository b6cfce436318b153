//! Deletion ledger contracts and SQLite implementation.
//!
//! # Responsibility
//! - Record deletion transactions with their requested and cascaded entities.
//! - Track the one-way `reverted` flag.
//!
//! # Invariants
//! - Deletion ids come from `AUTOINCREMENT` and are never reused, even after
//!   revert.
//! - A deletion is immutable except for `is_reverted/reverted_at/reverted_by`.
//! - Entry order is preserved through `position`.

use crate::model::deletion::{DeletionId, DeletionTransaction};
use crate::model::entity::{EntityKind, EntityRef, TechId};
use crate::repo::{bool_to_int, parse_flag, parse_uuid, RepoError, RepoResult};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};

const DELETION_SELECT_SQL: &str = "SELECT
    deletion_id,
    reason,
    actor,
    deleted_at,
    is_reverted,
    reverted_at,
    reverted_by
FROM deletions";

const ROLE_ORIGINAL: &str = "original";
const ROLE_CASCADED: &str = "cascaded";

/// Query options for listing deletions.
#[derive(Debug, Clone, Default)]
pub struct DeletionListQuery {
    pub include_reverted: bool,
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Repository interface for the deletion ledger.
pub trait DeletionLedger {
    /// Records one deletion and returns its fresh id.
    fn record_deletion(
        &self,
        original: &[TechId],
        cascaded: &[TechId],
        reason: &str,
        actor: &str,
    ) -> RepoResult<DeletionId>;
    /// Loads one deletion, reverted or not.
    fn get_deletion(&self, deletion_id: DeletionId) -> RepoResult<Option<DeletionTransaction>>;
    /// Sets the reverted flag. Fails with `DeletionNotFound` when the
    /// deletion is unknown or already reverted.
    fn mark_reverted(&self, deletion_id: DeletionId, actor: &str) -> RepoResult<()>;
    /// Lists deletions newest first.
    fn list_deletions(&self, query: &DeletionListQuery) -> RepoResult<Vec<DeletionTransaction>>;
}

/// SQLite-backed deletion ledger.
pub struct SqliteDeletionLedger<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteDeletionLedger<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn load_entries(&self, deletion_id: DeletionId, role: &str) -> RepoResult<Vec<EntityRef>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                e.tech_id,
                e.perm_id,
                e.kind,
                e.code,
                e.space_code
             FROM deletion_entries d
             INNER JOIN entities e ON e.tech_id = d.entity_tech_id
             WHERE d.deletion_id = ?1
               AND d.role = ?2
             ORDER BY d.position ASC;",
        )?;
        let mut rows = stmt.query(params![deletion_id.as_raw(), role])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(parse_entry_row(row)?);
        }
        Ok(entries)
    }

    fn hydrate(&self, row: DeletionRow) -> RepoResult<DeletionTransaction> {
        let original_entities = self.load_entries(row.deletion_id, ROLE_ORIGINAL)?;
        let cascaded_entities = self.load_entries(row.deletion_id, ROLE_CASCADED)?;
        Ok(DeletionTransaction {
            deletion_id: row.deletion_id,
            original_entities,
            cascaded_entities,
            reason: row.reason,
            actor: row.actor,
            deleted_at: row.deleted_at,
            reverted: row.reverted,
            reverted_at: row.reverted_at,
            reverted_by: row.reverted_by,
        })
    }
}

impl DeletionLedger for SqliteDeletionLedger<'_> {
    fn record_deletion(
        &self,
        original: &[TechId],
        cascaded: &[TechId],
        reason: &str,
        actor: &str,
    ) -> RepoResult<DeletionId> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(RepoError::Validation(
                "deletion reason must not be blank".to_string(),
            ));
        }

        self.conn.execute(
            "INSERT INTO deletions (reason, actor) VALUES (?1, ?2);",
            params![reason, actor],
        )?;
        let deletion_id = DeletionId::from_raw(self.conn.last_insert_rowid());

        let mut stmt = self.conn.prepare(
            "INSERT INTO deletion_entries (deletion_id, entity_tech_id, role, position)
             VALUES (?1, ?2, ?3, ?4);",
        )?;
        for (role, ids) in [(ROLE_ORIGINAL, original), (ROLE_CASCADED, cascaded)] {
            for (position, tech_id) in ids.iter().enumerate() {
                stmt.execute(params![
                    deletion_id.as_raw(),
                    tech_id,
                    role,
                    position as i64
                ])?;
            }
        }

        Ok(deletion_id)
    }

    fn get_deletion(&self, deletion_id: DeletionId) -> RepoResult<Option<DeletionTransaction>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{DELETION_SELECT_SQL} WHERE deletion_id = ?1;"))?;
        let mut rows = stmt.query([deletion_id.as_raw()])?;
        let row = match rows.next()? {
            Some(row) => parse_deletion_row(row)?,
            None => return Ok(None),
        };
        Ok(Some(self.hydrate(row)?))
    }

    fn mark_reverted(&self, deletion_id: DeletionId, actor: &str) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE deletions
             SET is_reverted = 1,
                 reverted_at = (strftime('%s', 'now') * 1000),
                 reverted_by = ?2
             WHERE deletion_id = ?1
               AND is_reverted = 0;",
            params![deletion_id.as_raw(), actor],
        )?;
        if changed == 0 {
            return Err(RepoError::DeletionNotFound(deletion_id));
        }
        Ok(())
    }

    fn list_deletions(&self, query: &DeletionListQuery) -> RepoResult<Vec<DeletionTransaction>> {
        let mut sql = format!("{DELETION_SELECT_SQL} WHERE (?1 = 1 OR is_reverted = 0)");
        let mut bind_values: Vec<Value> =
            vec![Value::Integer(bool_to_int(query.include_reverted))];

        sql.push_str(" ORDER BY deleted_at DESC, deletion_id DESC");

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?2 OFFSET ?3");
            bind_values.push(Value::Integer(i64::from(limit)));
            bind_values.push(Value::Integer(i64::from(query.offset)));
        } else if query.offset > 0 {
            sql.push_str(" LIMIT -1 OFFSET ?2");
            bind_values.push(Value::Integer(i64::from(query.offset)));
        }

        let rows = {
            let mut stmt = self.conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(bind_values))?;
            let mut parsed = Vec::new();
            while let Some(row) = rows.next()? {
                parsed.push(parse_deletion_row(row)?);
            }
            parsed
        };

        rows.into_iter().map(|row| self.hydrate(row)).collect()
    }
}

struct DeletionRow {
    deletion_id: DeletionId,
    reason: String,
    actor: String,
    deleted_at: i64,
    reverted: bool,
    reverted_at: Option<i64>,
    reverted_by: Option<String>,
}

fn parse_deletion_row(row: &Row<'_>) -> RepoResult<DeletionRow> {
    Ok(DeletionRow {
        deletion_id: DeletionId::from_raw(row.get("deletion_id")?),
        reason: row.get("reason")?,
        actor: row.get("actor")?,
        deleted_at: row.get("deleted_at")?,
        reverted: parse_flag(row.get("is_reverted")?, "deletions.is_reverted")?,
        reverted_at: row.get("reverted_at")?,
        reverted_by: row.get("reverted_by")?,
    })
}

fn parse_entry_row(row: &Row<'_>) -> RepoResult<EntityRef> {
    let perm_id_text: String = row.get(1)?;
    let perm_id = parse_uuid(&perm_id_text, "entities.perm_id")?;
    let kind_text: String = row.get(2)?;
    let kind = EntityKind::parse(&kind_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid entity kind `{kind_text}` in entities.kind"))
    })?;
    let code: String = row.get(3)?;
    Ok(EntityRef::new(row.get(0)?, perm_id, kind, row.get(4)?, &code))
}
