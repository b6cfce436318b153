//! Entity use-case service.
//!
//! # Responsibility
//! - Create entities with their ownership edges in one transaction.
//! - Update properties, link and unlink active entities.
//! - Read entities filtered by caller visibility.
//!
//! # Invariants
//! - Tombstoned entities are frozen: mutations treat them as not found, so a
//!   revert always restores pre-delete values.
//! - Ownership stays acyclic; `link` rejects an edge that closes a cycle.
//! - Codes stay reserved while their entity sits in the trash.

use crate::auth::session::{Permission, Session};
use crate::model::edge::{EdgeKind, RelationshipEdge};
use crate::model::entity::{
    Entity, EntityDraft, EntityKind, EntityRef, PermId, Properties, TechId,
};
use crate::repo::entity_repo::{EntityListQuery, EntityRepository, SqliteEntityRepository};
use crate::repo::graph_repo::{GraphRepository, SqliteGraphRepository};
use crate::service::error::{NotFoundTarget, TrashError, TrashResult};
use crate::service::log_outcome;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::{HashSet, VecDeque};
use std::time::Instant;

/// Creation request for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntity {
    pub kind: EntityKind,
    pub code: String,
    pub space: Option<String>,
    pub properties: Properties,
    /// Parents to link the new entity under.
    pub parents: Vec<(PermId, EdgeKind)>,
}

impl NewEntity {
    pub fn new(kind: EntityKind, code: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            space: None,
            properties: Properties::new(),
            parents: Vec::new(),
        }
    }

    pub fn in_space(mut self, space: impl Into<String>) -> Self {
        self.space = Some(space.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent: PermId, kind: EdgeKind) -> Self {
        self.parents.push((parent, kind));
        self
    }
}

/// Entity facade bound to one connection.
pub struct EntityService<'conn> {
    conn: &'conn Connection,
}

impl<'conn> EntityService<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Creates one entity and links it under its parents.
    ///
    /// # Errors
    /// - `Validation` for malformed codes, a missing or trashed space, a
    ///   duplicate code or an illegal edge kind.
    /// - `NotFound` for a parent that does not exist or is in the trash.
    /// - `Authorization` when the caller may not write in the target scope.
    pub fn create_entity(&self, session: &Session, request: NewEntity) -> TrashResult<Entity> {
        let started_at = Instant::now();
        let kind = request.kind;
        let result = self.create_entity_in_tx(session, request);
        log_outcome("entity_create", started_at, &result, |entity| {
            format!("kind={kind} tech_id={}", entity.tech_id)
        });
        result
    }

    /// Replaces the property bag of one active entity.
    pub fn update_properties(
        &self,
        session: &Session,
        perm_id: PermId,
        properties: Properties,
    ) -> TrashResult<Entity> {
        let started_at = Instant::now();
        let result = self.update_properties_in_tx(session, perm_id, &properties);
        log_outcome("entity_update", started_at, &result, |entity| {
            format!("tech_id={}", entity.tech_id)
        });
        result
    }

    /// Adds an ownership edge between two active entities.
    ///
    /// Returns `false` when the edge already existed.
    pub fn link(
        &self,
        session: &Session,
        child: PermId,
        parent: PermId,
        kind: EdgeKind,
    ) -> TrashResult<bool> {
        let started_at = Instant::now();
        let result = self.link_in_tx(session, child, parent, kind);
        log_outcome("entity_link", started_at, &result, |added| {
            format!("edge_kind={kind} added={added}")
        });
        result
    }

    /// Removes an ownership edge between two active entities.
    pub fn unlink(
        &self,
        session: &Session,
        child: PermId,
        parent: PermId,
        kind: EdgeKind,
    ) -> TrashResult<()> {
        let started_at = Instant::now();
        let result = self.unlink_in_tx(session, child, parent, kind);
        log_outcome("entity_unlink", started_at, &result, |_| {
            format!("edge_kind={kind}")
        });
        result
    }

    /// Loads one entity the caller may read.
    pub fn get_entity(
        &self,
        session: &Session,
        perm_id: PermId,
        include_deleted: bool,
    ) -> TrashResult<Entity> {
        let repo = SqliteEntityRepository::new(self.conn);
        load_visible(&repo, session, perm_id, include_deleted)
    }

    /// Loads entities in requested order, skipping unknown, invisible and
    /// (unless `include_deleted`) trashed ones.
    pub fn list_entities(
        &self,
        session: &Session,
        perm_ids: &[PermId],
        include_deleted: bool,
    ) -> TrashResult<Vec<Entity>> {
        let started_at = Instant::now();
        let result = self.collect_listed(session, perm_ids, include_deleted);
        log_outcome("entities_list", started_at, &result, |entities| {
            format!("requested={} count={}", perm_ids.len(), entities.len())
        });
        result
    }

    /// Lists entities matching `query` that the caller may read.
    pub fn search_entities(
        &self,
        session: &Session,
        query: &EntityListQuery,
    ) -> TrashResult<Vec<Entity>> {
        let started_at = Instant::now();
        let result = SqliteEntityRepository::new(self.conn)
            .list_entities(query)
            .map(|entities| {
                entities
                    .into_iter()
                    .filter(|entity| session.can_read(entity))
                    .collect::<Vec<_>>()
            })
            .map_err(TrashError::from);
        log_outcome("entities_search", started_at, &result, |entities| {
            format!("count={}", entities.len())
        });
        result
    }

    /// Active children of one visible entity with the connecting edge.
    pub fn list_children(
        &self,
        session: &Session,
        perm_id: PermId,
    ) -> TrashResult<Vec<(EdgeKind, Entity)>> {
        let entities = SqliteEntityRepository::new(self.conn);
        let graph = SqliteGraphRepository::new(self.conn);
        let parent = load_visible(&entities, session, perm_id, false)?;
        let edges = graph.edges_from(parent.tech_id)?;
        collect_related(&entities, session, edges.iter().map(|edge| (edge.kind, edge.child)))
    }

    /// Active parents of one visible entity with the connecting edge.
    pub fn list_parents(
        &self,
        session: &Session,
        perm_id: PermId,
    ) -> TrashResult<Vec<(EdgeKind, Entity)>> {
        let entities = SqliteEntityRepository::new(self.conn);
        let graph = SqliteGraphRepository::new(self.conn);
        let child = load_visible(&entities, session, perm_id, false)?;
        let edges = graph.edges_to(child.tech_id)?;
        collect_related(&entities, session, edges.iter().map(|edge| (edge.kind, edge.parent)))
    }

    fn collect_listed(
        &self,
        session: &Session,
        perm_ids: &[PermId],
        include_deleted: bool,
    ) -> TrashResult<Vec<Entity>> {
        let repo = SqliteEntityRepository::new(self.conn);
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for perm_id in perm_ids {
            if !seen.insert(*perm_id) {
                continue;
            }
            if let Some(entity) = repo.get_entity(*perm_id, include_deleted)? {
                if session.can_read(&entity) {
                    found.push(entity);
                }
            }
        }
        Ok(found)
    }

    fn create_entity_in_tx(&self, session: &Session, request: NewEntity) -> TrashResult<Entity> {
        let draft = EntityDraft::new(
            request.kind,
            &request.code,
            request.space.as_deref(),
            request.properties,
        )?;
        session.check(
            Permission::Write,
            &EntityRef::new(0, draft.perm_id, draft.kind, draft.space.clone(), &draft.code),
        )?;

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let entities = SqliteEntityRepository::new(&tx);
        let graph = SqliteGraphRepository::new(&tx);

        if let Some(space) = draft.space.as_deref().filter(|_| draft.kind != EntityKind::Space) {
            let owner = entities.find_by_code(EntityKind::Space, Some(space), space)?;
            if !owner.is_some_and(|owner| owner.is_active()) {
                return Err(TrashError::Validation(format!("space /{space} does not exist")));
            }
        }
        if entities
            .find_by_code(draft.kind, draft.space.as_deref(), &draft.code)?
            .is_some()
        {
            return Err(TrashError::Validation(format!(
                "{} {} already exists",
                draft.kind.label(),
                draft.identifier()
            )));
        }

        let mut parents = Vec::with_capacity(request.parents.len());
        for (parent_id, edge_kind) in &request.parents {
            let parent = load_visible(&entities, session, *parent_id, false)?;
            ensure_edge_allowed(*edge_kind, draft.kind, &parent)?;
            parents.push((parent.tech_id, *edge_kind));
        }

        let entity = entities.create_entity(&draft)?;
        for (parent, kind) in parents {
            graph.add_edge(&RelationshipEdge {
                child: entity.tech_id,
                parent,
                kind,
            })?;
        }

        tx.commit()?;
        Ok(entity)
    }

    fn update_properties_in_tx(
        &self,
        session: &Session,
        perm_id: PermId,
        properties: &Properties,
    ) -> TrashResult<Entity> {
        if properties.keys().any(|key| key.trim().is_empty()) {
            return Err(TrashError::validation("property keys must not be blank"));
        }

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let entities = SqliteEntityRepository::new(&tx);
        let entity = load_visible(&entities, session, perm_id, false)?;
        session.check_entity(Permission::Write, &entity)?;
        entities.update_properties(perm_id, properties)?;
        let updated = entities
            .get_entity(perm_id, false)?
            .ok_or(TrashError::NotFound(NotFoundTarget::Entity(perm_id)))?;

        tx.commit()?;
        Ok(updated)
    }

    fn link_in_tx(
        &self,
        session: &Session,
        child: PermId,
        parent: PermId,
        kind: EdgeKind,
    ) -> TrashResult<bool> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let entities = SqliteEntityRepository::new(&tx);
        let graph = SqliteGraphRepository::new(&tx);

        let child = load_visible(&entities, session, child, false)?;
        let parent = load_visible(&entities, session, parent, false)?;
        session.check_entity(Permission::Write, &child)?;
        ensure_edge_allowed(kind, child.kind, &parent)?;
        if reaches(&graph, child.tech_id, parent.tech_id)? {
            return Err(TrashError::Validation(format!(
                "linking {} under {} would create a cycle",
                child.identifier(),
                parent.identifier()
            )));
        }

        let added = graph.add_edge(&RelationshipEdge {
            child: child.tech_id,
            parent: parent.tech_id,
            kind,
        })?;
        tx.commit()?;
        Ok(added)
    }

    fn unlink_in_tx(
        &self,
        session: &Session,
        child: PermId,
        parent: PermId,
        kind: EdgeKind,
    ) -> TrashResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let entities = SqliteEntityRepository::new(&tx);
        let graph = SqliteGraphRepository::new(&tx);

        let child = load_visible(&entities, session, child, false)?;
        let parent = load_visible(&entities, session, parent, false)?;
        session.check_entity(Permission::Write, &child)?;
        let removed = graph.remove_edge(&RelationshipEdge {
            child: child.tech_id,
            parent: parent.tech_id,
            kind,
        })?;
        if !removed {
            return Err(TrashError::Validation(format!(
                "{} is not linked under {} as {kind}",
                child.identifier(),
                parent.identifier()
            )));
        }

        tx.commit()?;
        Ok(())
    }
}

/// Loads an entity, reporting invisible ones as not found.
fn load_visible<R: EntityRepository>(
    repo: &R,
    session: &Session,
    perm_id: PermId,
    include_deleted: bool,
) -> TrashResult<Entity> {
    repo.get_entity(perm_id, include_deleted)?
        .filter(|entity| session.can_read(entity))
        .ok_or(TrashError::NotFound(NotFoundTarget::Entity(perm_id)))
}

fn collect_related<R: EntityRepository>(
    repo: &R,
    session: &Session,
    related: impl Iterator<Item = (EdgeKind, TechId)>,
) -> TrashResult<Vec<(EdgeKind, Entity)>> {
    let mut found = Vec::new();
    for (kind, tech_id) in related {
        if let Some(entity) = repo.get_entity_by_tech_id(tech_id)? {
            if entity.is_active() && session.can_read(&entity) {
                found.push((kind, entity));
            }
        }
    }
    Ok(found)
}

fn ensure_edge_allowed(kind: EdgeKind, child_kind: EntityKind, parent: &Entity) -> TrashResult<()> {
    if kind.allows(child_kind, parent.kind) {
        return Ok(());
    }
    Err(TrashError::Validation(format!(
        "a {} cannot be linked as {kind} under the {} {}",
        child_kind.label(),
        parent.kind.label(),
        parent.identifier()
    )))
}

/// Returns whether `target` is `from` or one of its descendants.
fn reaches<G: GraphRepository>(graph: &G, from: TechId, target: TechId) -> TrashResult<bool> {
    let mut visited = HashSet::from([from]);
    let mut queue = VecDeque::from([from]);
    while let Some(current) = queue.pop_front() {
        if current == target {
            return Ok(true);
        }
        for edge in graph.edges_from(current)? {
            if visited.insert(edge.child) {
                queue.push_back(edge.child);
            }
        }
    }
    Ok(false)
}
