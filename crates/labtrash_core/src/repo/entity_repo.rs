//! Entity store contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide create/read/update APIs over canonical `entities` storage.
//! - Own the only write path for tombstone state (`set_state`).
//!
//! # Invariants
//! - Only active entities are returned unless deleted rows are requested.
//! - `set_state` keeps `is_deleted` and `deletion_id` consistent.
//! - Property updates never touch tombstoned rows.

use crate::model::deletion::DeletionId;
use crate::model::entity::{
    Entity, EntityDraft, EntityKind, EntityState, PermId, Properties, TechId,
};
use crate::repo::{bool_to_int, parse_flag, parse_uuid, RepoError, RepoResult};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};

const ENTITY_SELECT_SQL: &str = "SELECT
    tech_id,
    perm_id,
    kind,
    code,
    space_code,
    properties,
    is_deleted,
    deletion_id,
    created_at,
    updated_at
FROM entities";

/// Query options for listing entities.
#[derive(Debug, Clone, Default)]
pub struct EntityListQuery {
    pub kind: Option<EntityKind>,
    /// Normalized space code.
    pub space: Option<String>,
    pub include_deleted: bool,
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Repository interface for the entity store.
pub trait EntityRepository {
    /// Inserts a validated draft and returns the stored row.
    fn create_entity(&self, draft: &EntityDraft) -> RepoResult<Entity>;
    /// Loads one entity by permanent id.
    fn get_entity(&self, perm_id: PermId, include_deleted: bool) -> RepoResult<Option<Entity>>;
    /// Loads one entity by numeric id in any state.
    fn get_entity_by_tech_id(&self, tech_id: TechId) -> RepoResult<Option<Entity>>;
    /// Finds an entity by its unique `(kind, space, code)` key in any state.
    fn find_by_code(
        &self,
        kind: EntityKind,
        space: Option<&str>,
        code: &str,
    ) -> RepoResult<Option<Entity>>;
    /// Lists entities ordered by `tech_id ASC`.
    fn list_entities(&self, query: &EntityListQuery) -> RepoResult<Vec<Entity>>;
    /// Replaces the property bag of an active entity.
    fn update_properties(&self, perm_id: PermId, properties: &Properties) -> RepoResult<()>;
    /// Flips tombstone state. Caller must hold the write transaction.
    fn set_state(
        &self,
        tech_id: TechId,
        state: EntityState,
        deletion_id: Option<DeletionId>,
    ) -> RepoResult<()>;
    /// Active non-space entities scoped to `space`.
    fn list_active_member_ids(&self, space: &str) -> RepoResult<Vec<TechId>>;
}

/// SQLite-backed entity store.
pub struct SqliteEntityRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteEntityRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl EntityRepository for SqliteEntityRepository<'_> {
    fn create_entity(&self, draft: &EntityDraft) -> RepoResult<Entity> {
        let properties = properties_to_db(&draft.properties)?;
        self.conn.execute(
            "INSERT INTO entities (
                perm_id,
                kind,
                code,
                space_code,
                properties,
                is_deleted,
                deletion_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL);",
            params![
                draft.perm_id.to_string(),
                draft.kind.as_str(),
                draft.code.as_str(),
                draft.space.as_deref(),
                properties,
            ],
        )?;

        let tech_id = self.conn.last_insert_rowid();
        self.get_entity_by_tech_id(tech_id)?
            .ok_or_else(|| RepoError::InvalidData(format!("entity {tech_id} missing after insert")))
    }

    fn get_entity(&self, perm_id: PermId, include_deleted: bool) -> RepoResult<Option<Entity>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ENTITY_SELECT_SQL}
             WHERE perm_id = ?1
               AND (?2 = 1 OR is_deleted = 0);"
        ))?;
        let mut rows = stmt.query(params![perm_id.to_string(), bool_to_int(include_deleted)])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_entity_row(row)?));
        }
        Ok(None)
    }

    fn get_entity_by_tech_id(&self, tech_id: TechId) -> RepoResult<Option<Entity>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{ENTITY_SELECT_SQL} WHERE tech_id = ?1;"))?;
        let mut rows = stmt.query([tech_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_entity_row(row)?));
        }
        Ok(None)
    }

    fn find_by_code(
        &self,
        kind: EntityKind,
        space: Option<&str>,
        code: &str,
    ) -> RepoResult<Option<Entity>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ENTITY_SELECT_SQL}
             WHERE kind = ?1
               AND COALESCE(space_code, '') = COALESCE(?2, '')
               AND code = ?3;"
        ))?;
        let mut rows = stmt.query(params![kind.as_str(), space, code])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_entity_row(row)?));
        }
        Ok(None)
    }

    fn list_entities(&self, query: &EntityListQuery) -> RepoResult<Vec<Entity>> {
        let mut sql = format!("{ENTITY_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();

        if !query.include_deleted {
            sql.push_str(" AND is_deleted = 0");
        }

        if let Some(kind) = query.kind {
            sql.push_str(" AND kind = ?");
            bind_values.push(Value::Text(kind.as_str().to_string()));
        }

        if let Some(space) = &query.space {
            sql.push_str(" AND space_code = ?");
            bind_values.push(Value::Text(space.clone()));
        }

        sql.push_str(" ORDER BY tech_id ASC");

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
            if query.offset > 0 {
                sql.push_str(" OFFSET ?");
                bind_values.push(Value::Integer(i64::from(query.offset)));
            }
        } else if query.offset > 0 {
            sql.push_str(" LIMIT -1 OFFSET ?");
            bind_values.push(Value::Integer(i64::from(query.offset)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            entities.push(parse_entity_row(row)?);
        }
        Ok(entities)
    }

    fn update_properties(&self, perm_id: PermId, properties: &Properties) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE entities
             SET properties = ?2,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE perm_id = ?1
               AND is_deleted = 0;",
            params![perm_id.to_string(), properties_to_db(properties)?],
        )?;
        if changed == 0 {
            return Err(RepoError::EntityNotFound(perm_id));
        }
        Ok(())
    }

    fn set_state(
        &self,
        tech_id: TechId,
        state: EntityState,
        deletion_id: Option<DeletionId>,
    ) -> RepoResult<()> {
        let is_deleted = match (state, deletion_id) {
            (EntityState::Active, None) => false,
            (EntityState::Deleted, Some(_)) => true,
            (state, deletion_id) => {
                return Err(RepoError::Validation(format!(
                    "inconsistent tombstone update for entity {tech_id}: state {state:?} with deletion {deletion_id:?}"
                )));
            }
        };

        let changed = self.conn.execute(
            "UPDATE entities
             SET is_deleted = ?2,
                 deletion_id = ?3,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE tech_id = ?1;",
            params![
                tech_id,
                bool_to_int(is_deleted),
                deletion_id.map(DeletionId::as_raw),
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::InvalidData(format!(
                "entity {tech_id} vanished during state change"
            )));
        }
        Ok(())
    }

    fn list_active_member_ids(&self, space: &str) -> RepoResult<Vec<TechId>> {
        let mut stmt = self.conn.prepare(
            "SELECT tech_id
             FROM entities
             WHERE space_code = ?1
               AND kind <> 'space'
               AND is_deleted = 0
             ORDER BY tech_id ASC;",
        )?;
        let mut rows = stmt.query([space])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get(0)?);
        }
        Ok(ids)
    }
}

fn parse_entity_row(row: &Row<'_>) -> RepoResult<Entity> {
    let perm_id_text: String = row.get("perm_id")?;
    let perm_id = parse_uuid(&perm_id_text, "entities.perm_id")?;

    let kind_text: String = row.get("kind")?;
    let kind = EntityKind::parse(&kind_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid entity kind `{kind_text}` in entities.kind"))
    })?;

    let properties_text: String = row.get("properties")?;
    let properties: Properties = serde_json::from_str(&properties_text).map_err(|err| {
        RepoError::InvalidData(format!("invalid JSON in entities.properties: {err}"))
    })?;

    let is_deleted = parse_flag(row.get("is_deleted")?, "entities.is_deleted")?;
    let deletion_id = row
        .get::<_, Option<i64>>("deletion_id")?
        .map(DeletionId::from_raw);

    let state = match (is_deleted, deletion_id) {
        (false, None) => EntityState::Active,
        (true, Some(_)) => EntityState::Deleted,
        _ => {
            return Err(RepoError::InvalidData(format!(
                "entity {perm_id_text} has inconsistent is_deleted/deletion_id"
            )));
        }
    };

    Ok(Entity {
        tech_id: row.get("tech_id")?,
        perm_id,
        kind,
        code: row.get("code")?,
        space: row.get("space_code")?,
        state,
        properties,
        deletion_id,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn properties_to_db(properties: &Properties) -> RepoResult<String> {
    serde_json::to_string(properties)
        .map_err(|err| RepoError::InvalidData(format!("cannot encode properties: {err}")))
}
