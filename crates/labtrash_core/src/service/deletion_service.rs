//! Deletion and reversal use cases.
//!
//! # Responsibility
//! - Tombstone a requested set of entities plus their cascade as one deletion.
//! - Revert batches of deletions, restoring exactly the entities they own.
//! - Expose the ledger to callers that may read the covered entities.
//!
//! # Invariants
//! - Each mutating call runs in one `BEGIN IMMEDIATE` transaction; the
//!   closure is computed under the write lock and all states flip at commit.
//! - Every check (existence, authorization, ownership, space liveness)
//!   completes before the first write.
//! - An entity is `Deleted` iff exactly one non-reverted deletion lists it as
//!   cascaded, and that deletion's id is mirrored in `Entity::deletion_id`.

use crate::auth::session::{AccessDenied, Permission, Role, Session};
use crate::model::deletion::{DeletionId, DeletionTransaction};
use crate::model::edge::RelationshipEdge;
use crate::model::entity::{Entity, EntityKind, EntityState, PermId, TechId};
use crate::repo::deletion_repo::{DeletionLedger, DeletionListQuery, SqliteDeletionLedger};
use crate::repo::entity_repo::{EntityRepository, SqliteEntityRepository};
use crate::repo::graph_repo::{GraphRepository, SqliteGraphRepository};
use crate::repo::{RepoError, RepoResult};
use crate::service::cascade::{resolve_cascade, CascadeSource};
use crate::service::error::{NotFoundTarget, TrashError, TrashResult};
use crate::service::log_outcome;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::HashSet;
use std::time::Instant;

/// Deletion and reversal facade bound to one connection.
pub struct DeletionService<'conn> {
    conn: &'conn Connection,
}

impl<'conn> DeletionService<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Moves `perm_ids` and every active dependent to the trash.
    ///
    /// Entities already in the trash stay owned by their earlier deletion;
    /// they are listed as requested in the new deletion but not cascaded.
    ///
    /// # Errors
    /// - `Validation` for a blank reason, an empty id list or a space that is
    ///   still in use.
    /// - `NotFound` for the first unknown id.
    /// - `Authorization` for the first entity the caller may not delete.
    pub fn delete_entities(
        &self,
        session: &Session,
        perm_ids: &[PermId],
        reason: &str,
    ) -> TrashResult<DeletionId> {
        let started_at = Instant::now();
        let result = self.delete_entities_in_tx(session, perm_ids, reason);
        log_outcome("entities_delete", started_at, &result, |(deletion_id, cascaded)| {
            format!(
                "deletion_id={deletion_id} requested={} cascaded={cascaded}",
                perm_ids.len()
            )
        });
        result.map(|(deletion_id, _)| deletion_id)
    }

    /// Restores every entity owned by the given deletions.
    ///
    /// The batch is all-or-nothing: one unknown, reverted, repeated or
    /// unauthorized deletion leaves every entity untouched, as does an entity
    /// whose space stays in the trash after the batch.
    pub fn revert_deletions(
        &self,
        session: &Session,
        deletion_ids: &[DeletionId],
    ) -> TrashResult<()> {
        let started_at = Instant::now();
        let result = self.revert_deletions_in_tx(session, deletion_ids);
        log_outcome("deletions_revert", started_at, &result, |restored| {
            format!("deletions={} restored={restored}", deletion_ids.len())
        });
        result.map(|_| ())
    }

    /// Loads one deletion, reverted or not.
    ///
    /// Deletions the caller may not inspect are reported as not found.
    pub fn get_deletion(
        &self,
        session: &Session,
        deletion_id: DeletionId,
    ) -> TrashResult<DeletionTransaction> {
        let started_at = Instant::now();
        let result = SqliteDeletionLedger::new(self.conn)
            .get_deletion(deletion_id)
            .map_err(TrashError::from)
            .and_then(|found| {
                found
                    .filter(|deletion| can_inspect(session, deletion))
                    .ok_or(TrashError::NotFound(NotFoundTarget::Deletion(deletion_id)))
            });
        log_outcome("deletion_get", started_at, &result, |_| {
            format!("deletion_id={deletion_id}")
        });
        result
    }

    /// Lists deletions newest first, restricted to those the caller may
    /// inspect. `limit` and `offset` count visible deletions only.
    pub fn list_deletions(
        &self,
        session: &Session,
        query: &DeletionListQuery,
    ) -> TrashResult<Vec<DeletionTransaction>> {
        let started_at = Instant::now();
        let unpaged = DeletionListQuery {
            include_reverted: query.include_reverted,
            limit: None,
            offset: 0,
        };
        let result = SqliteDeletionLedger::new(self.conn)
            .list_deletions(&unpaged)
            .map(|deletions| {
                let visible = deletions
                    .into_iter()
                    .filter(|deletion| can_inspect(session, deletion))
                    .skip(query.offset as usize);
                match query.limit {
                    Some(limit) => visible.take(limit as usize).collect::<Vec<_>>(),
                    None => visible.collect(),
                }
            })
            .map_err(TrashError::from);
        log_outcome("deletions_list", started_at, &result, |deletions| {
            format!("count={}", deletions.len())
        });
        result
    }

    fn delete_entities_in_tx(
        &self,
        session: &Session,
        perm_ids: &[PermId],
        reason: &str,
    ) -> TrashResult<(DeletionId, usize)> {
        if reason.trim().is_empty() {
            return Err(TrashError::validation("deletion reason must not be blank"));
        }

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let entities = SqliteEntityRepository::new(&tx);
        let source = StoreSource {
            entities: SqliteEntityRepository::new(&tx),
            graph: SqliteGraphRepository::new(&tx),
        };
        let plan = resolve_cascade(&source, session, perm_ids)?;

        let ledger = SqliteDeletionLedger::new(&tx);
        let deletion_id = ledger.record_deletion(
            &plan.requested_ids(),
            &plan.closure_ids(),
            reason,
            session.actor(),
        )?;
        for entity in &plan.closure {
            entities.set_state(entity.tech_id, EntityState::Deleted, Some(deletion_id))?;
        }

        tx.commit()?;
        Ok((deletion_id, plan.closure.len()))
    }

    fn revert_deletions_in_tx(
        &self,
        session: &Session,
        deletion_ids: &[DeletionId],
    ) -> TrashResult<usize> {
        if deletion_ids.is_empty() {
            return Err(TrashError::validation(
                "at least one deletion must be given to revert",
            ));
        }

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let ledger = SqliteDeletionLedger::new(&tx);
        let entities = SqliteEntityRepository::new(&tx);

        let mut seen = HashSet::new();
        let mut pending = Vec::with_capacity(deletion_ids.len());
        for deletion_id in deletion_ids {
            let not_found = TrashError::NotFound(NotFoundTarget::Deletion(*deletion_id));
            if !seen.insert(*deletion_id) {
                return Err(not_found);
            }
            let deletion = match ledger.get_deletion(*deletion_id)? {
                Some(deletion) if !deletion.reverted => deletion,
                _ => return Err(not_found),
            };
            authorize_revert(session, &deletion)?;
            pending.push(deletion);
        }

        let mut restore: Vec<Entity> = Vec::new();
        for deletion in &pending {
            for entry in &deletion.cascaded_entities {
                let entity = entities.get_entity_by_tech_id(entry.tech_id)?.ok_or_else(|| {
                    RepoError::InvalidData(format!(
                        "entity {} of deletion {} is missing",
                        entry.perm_id, deletion.deletion_id
                    ))
                })?;
                ensure_owned_by(&entity, deletion.deletion_id)?;
                restore.push(entity);
            }
        }
        let restoring: HashSet<TechId> = restore.iter().map(|entity| entity.tech_id).collect();
        for entity in &restore {
            ensure_space_restorable(&entities, entity, &restoring)?;
        }

        for entity in &restore {
            entities.set_state(entity.tech_id, EntityState::Active, None)?;
        }
        for deletion in &pending {
            ledger.mark_reverted(deletion.deletion_id, session.actor())?;
        }

        tx.commit()?;
        Ok(restore.len())
    }
}

/// Cascade source reading through the caller's open transaction.
struct StoreSource<'conn> {
    entities: SqliteEntityRepository<'conn>,
    graph: SqliteGraphRepository<'conn>,
}

impl CascadeSource for StoreSource<'_> {
    fn entity_by_perm_id(&self, perm_id: PermId) -> RepoResult<Option<Entity>> {
        self.entities.get_entity(perm_id, true)
    }

    fn entity_by_tech_id(&self, tech_id: TechId) -> RepoResult<Option<Entity>> {
        self.entities.get_entity_by_tech_id(tech_id)
    }

    fn child_edges(&self, parent: TechId) -> RepoResult<Vec<RelationshipEdge>> {
        self.graph.edges_from(parent)
    }

    fn parent_edges(&self, child: TechId) -> RepoResult<Vec<RelationshipEdge>> {
        self.graph.edges_to(child)
    }

    fn active_space_members(&self, space: &str) -> RepoResult<Vec<TechId>> {
        self.entities.list_active_member_ids(space)
    }
}

fn authorize_revert(session: &Session, deletion: &DeletionTransaction) -> TrashResult<()> {
    for entry in &deletion.cascaded_entities {
        session.check(Permission::Revert, entry)?;
    }
    if !deletion.cascaded_entities.is_empty()
        || session.is_instance_admin()
        || deletion.actor == session.actor()
    {
        return Ok(());
    }
    // A deletion that tombstoned nothing is only revertible by its actor.
    let Some(first) = deletion.original_entities.first() else {
        return Ok(());
    };
    Err(AccessDenied {
        actor: session.actor().to_string(),
        permission: Permission::Revert,
        required: Role::Admin,
        entity: first.clone(),
        context: session.context().map(str::to_string),
    }
    .into())
}

fn ensure_owned_by(entity: &Entity, deletion_id: DeletionId) -> TrashResult<()> {
    if entity.deletion_id == Some(deletion_id) {
        return Ok(());
    }
    Err(RepoError::InvalidData(format!(
        "entity {} is listed by deletion {deletion_id} but owned by {:?}",
        entity.perm_id, entity.deletion_id
    ))
    .into())
}

fn ensure_space_restorable(
    entities: &SqliteEntityRepository<'_>,
    entity: &Entity,
    restoring: &HashSet<TechId>,
) -> TrashResult<()> {
    let Some(space) = entity
        .space
        .as_deref()
        .filter(|_| entity.kind != EntityKind::Space)
    else {
        return Ok(());
    };
    match entities.find_by_code(EntityKind::Space, Some(space), space)? {
        Some(owner) if owner.is_active() || restoring.contains(&owner.tech_id) => Ok(()),
        _ => Err(TrashError::Validation(format!(
            "The {} {} cannot be restored while the space /{space} is in the trash.",
            entity.kind.label(),
            entity.identifier()
        ))),
    }
}

fn can_inspect(session: &Session, deletion: &DeletionTransaction) -> bool {
    session.is_instance_admin()
        || deletion.actor == session.actor()
        || deletion
            .original_entities
            .iter()
            .chain(&deletion.cascaded_entities)
            .all(|entry| session.can(Permission::Read, entry.kind, entry.space.as_deref()))
}
