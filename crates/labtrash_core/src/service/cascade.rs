//! Cascade resolver for deletion requests.
//!
//! # Responsibility
//! - Expand requested entities into the transitive closure of active
//!   dependents over child edges.
//! - Order the closure parents-before-children, ties by ascending `tech_id`.
//! - Authorize the caller against every entity in the closure.
//!
//! # Invariants
//! - Pure over `CascadeSource`: no writes, no ambient session state.
//! - Already-deleted entities are neither traversed nor re-tombstoned; they
//!   stay owned by their earlier deletion.
//! - Diamond dependencies yield each entity exactly once.
//! - A cascaded data set still contained in an active container outside the
//!   closure is released together with everything reached only through it.
//! - No cascaded entity may keep an active owner outside the closure.

use crate::auth::session::{Permission, Session};
use crate::model::edge::{EdgeKind, RelationshipEdge};
use crate::model::entity::{Entity, EntityKind, PermId, TechId};
use crate::repo::{RepoError, RepoResult};
use crate::service::error::{NotFoundTarget, TrashError, TrashResult};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

/// Read-only view of the store needed for cascade expansion.
pub trait CascadeSource {
    /// Entity by permanent id in any state.
    fn entity_by_perm_id(&self, perm_id: PermId) -> RepoResult<Option<Entity>>;
    /// Entity by numeric id in any state.
    fn entity_by_tech_id(&self, tech_id: TechId) -> RepoResult<Option<Entity>>;
    /// Edges whose parent is `parent`, any child state.
    fn child_edges(&self, parent: TechId) -> RepoResult<Vec<RelationshipEdge>>;
    /// Edges whose child is `child`, any parent state.
    fn parent_edges(&self, child: TechId) -> RepoResult<Vec<RelationshipEdge>>;
    /// Active non-space members of a space.
    fn active_space_members(&self, space: &str) -> RepoResult<Vec<TechId>>;
}

/// Outcome of cascade resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadePlan {
    /// Requested entities, deduplicated, in request order, any state.
    pub requested: Vec<Entity>,
    /// Active entities to tombstone, parents before children.
    pub closure: Vec<Entity>,
}

impl CascadePlan {
    pub fn requested_ids(&self) -> Vec<TechId> {
        self.requested.iter().map(|entity| entity.tech_id).collect()
    }

    pub fn closure_ids(&self) -> Vec<TechId> {
        self.closure.iter().map(|entity| entity.tech_id).collect()
    }
}

/// Resolves the full set of entities a deletion request tombstones.
///
/// # Errors
/// - `Validation` when nothing is requested, a space in the closure still
///   has active members outside it, or a cascaded entity belongs to an
///   active entity outside the closure.
/// - `NotFound` for the first requested id that does not exist.
/// - `Authorization` for the first closure entity the caller may not delete.
pub fn resolve_cascade<S: CascadeSource + ?Sized>(
    source: &S,
    session: &Session,
    requested: &[PermId],
) -> TrashResult<CascadePlan> {
    if requested.is_empty() {
        return Err(TrashError::validation(
            "at least one entity must be requested for deletion",
        ));
    }

    let mut seen = HashSet::new();
    let mut requested_entities = Vec::new();
    for perm_id in requested {
        if !seen.insert(*perm_id) {
            continue;
        }
        let entity = source
            .entity_by_perm_id(*perm_id)?
            .ok_or(TrashError::NotFound(NotFoundTarget::Entity(*perm_id)))?;
        requested_entities.push(entity);
    }

    let roots: HashSet<TechId> = requested_entities
        .iter()
        .map(|entity| entity.tech_id)
        .collect();
    let (mut nodes, mut links) = collect_closure(source, &requested_entities)?;
    release_shared_components(source, &roots, &mut nodes, &mut links)?;
    let order = topological_order(&nodes, &links)?;
    let closure: Vec<Entity> = order
        .into_iter()
        .filter_map(|tech_id| nodes.remove(&tech_id))
        .collect();

    for entity in &closure {
        session.check_entity(Permission::Delete, entity)?;
    }
    for entity in requested_entities.iter().filter(|entity| !entity.is_active()) {
        session.check_entity(Permission::Delete, entity)?;
    }

    ensure_spaces_unused(source, &closure)?;
    ensure_owners_inside(source, &roots, &closure)?;

    Ok(CascadePlan {
        requested: requested_entities,
        closure,
    })
}

type ClosureNodes = BTreeMap<TechId, Entity>;
type ClosureLinks = BTreeSet<(TechId, TechId)>;

fn collect_closure<S: CascadeSource + ?Sized>(
    source: &S,
    requested: &[Entity],
) -> TrashResult<(ClosureNodes, ClosureLinks)> {
    let mut nodes = ClosureNodes::new();
    let mut links = ClosureLinks::new();
    let mut queue = VecDeque::new();

    let mut roots: Vec<&Entity> = requested.iter().filter(|entity| entity.is_active()).collect();
    roots.sort_by_key(|entity| entity.tech_id);
    for root in roots {
        if nodes.insert(root.tech_id, root.clone()).is_none() {
            queue.push_back(root.tech_id);
        }
    }

    while let Some(parent) = queue.pop_front() {
        for edge in source.child_edges(parent)? {
            if nodes.contains_key(&edge.child) {
                links.insert((parent, edge.child));
                continue;
            }
            let child = source.entity_by_tech_id(edge.child)?.ok_or_else(|| {
                RepoError::InvalidData(format!(
                    "edge from {parent} points at missing entity {}",
                    edge.child
                ))
            })?;
            if !child.is_active() {
                continue;
            }
            links.insert((parent, child.tech_id));
            nodes.insert(child.tech_id, child);
            queue.push_back(edge.child);
        }
    }

    Ok((nodes, links))
}

/// Drops cascaded data sets that an active container outside the closure
/// still holds, until no such component remains. A data set owned by a
/// closure member is kept and left to `ensure_owners_inside`.
fn release_shared_components<S: CascadeSource + ?Sized>(
    source: &S,
    roots: &HashSet<TechId>,
    nodes: &mut ClosureNodes,
    links: &mut ClosureLinks,
) -> TrashResult<()> {
    loop {
        let mut released = Vec::new();
        let candidates = nodes.values().filter(|entity| {
            entity.kind == EntityKind::DataSet && !roots.contains(&entity.tech_id)
        });
        for entity in candidates {
            let edges = source.parent_edges(entity.tech_id)?;
            let owned_inside = edges.iter().any(|edge| {
                edge.kind == EdgeKind::BelongsTo && nodes.contains_key(&edge.parent)
            });
            if owned_inside {
                continue;
            }
            for edge in edges {
                if edge.kind != EdgeKind::ComponentOf || nodes.contains_key(&edge.parent) {
                    continue;
                }
                if active_entity(source, edge.parent)?.is_some() {
                    released.push(entity.tech_id);
                    break;
                }
            }
        }
        if released.is_empty() {
            return Ok(());
        }
        for tech_id in released {
            nodes.remove(&tech_id);
        }
        retain_reachable(roots, nodes, links);
    }
}

fn retain_reachable(roots: &HashSet<TechId>, nodes: &mut ClosureNodes, links: &mut ClosureLinks) {
    let mut reached: BTreeSet<TechId> = nodes
        .keys()
        .filter(|tech_id| roots.contains(tech_id))
        .copied()
        .collect();
    let mut queue: VecDeque<TechId> = reached.iter().copied().collect();
    while let Some(parent) = queue.pop_front() {
        for (_, child) in links.range((parent, TechId::MIN)..=(parent, TechId::MAX)) {
            if nodes.contains_key(child) && reached.insert(*child) {
                queue.push_back(*child);
            }
        }
    }
    nodes.retain(|tech_id, _| reached.contains(tech_id));
    links.retain(|(parent, child)| reached.contains(parent) && reached.contains(child));
}

fn active_entity<S: CascadeSource + ?Sized>(
    source: &S,
    tech_id: TechId,
) -> TrashResult<Option<Entity>> {
    Ok(source.entity_by_tech_id(tech_id)?.filter(Entity::is_active))
}

/// Kahn's algorithm restricted to the closure; the ready set is a `BTreeSet`
/// so equal-rank entities come out by ascending `tech_id`.
fn topological_order(nodes: &ClosureNodes, links: &ClosureLinks) -> TrashResult<Vec<TechId>> {
    let mut indegree: BTreeMap<TechId, usize> = nodes.keys().map(|id| (*id, 0)).collect();
    let mut children: BTreeMap<TechId, Vec<TechId>> = BTreeMap::new();
    for (parent, child) in links {
        if let Some(degree) = indegree.get_mut(child) {
            *degree += 1;
        }
        children.entry(*parent).or_default().push(*child);
    }

    let mut ready: BTreeSet<TechId> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        let Some(kids) = children.get(&next) else {
            continue;
        };
        for kid in kids {
            if let Some(degree) = indegree.get_mut(kid) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*kid);
                }
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(RepoError::InvalidData(format!(
            "ownership cycle among {} entities of the deletion set",
            nodes.len() - order.len()
        ))
        .into());
    }
    Ok(order)
}

fn ensure_spaces_unused<S: CascadeSource + ?Sized>(
    source: &S,
    closure: &[Entity],
) -> TrashResult<()> {
    let covered: HashSet<TechId> = closure.iter().map(|entity| entity.tech_id).collect();
    for space in closure
        .iter()
        .filter(|entity| entity.kind == EntityKind::Space)
    {
        let outside = source
            .active_space_members(&space.code)?
            .into_iter()
            .filter(|tech_id| !covered.contains(tech_id))
            .count();
        if outside > 0 {
            return Err(TrashError::Validation(format!(
                "The space {} is being used by {outside} active entities which are outside the deletion set.",
                space.identifier()
            )));
        }
    }
    Ok(())
}

fn ensure_owners_inside<S: CascadeSource + ?Sized>(
    source: &S,
    roots: &HashSet<TechId>,
    closure: &[Entity],
) -> TrashResult<()> {
    let covered: HashSet<TechId> = closure.iter().map(|entity| entity.tech_id).collect();
    for entity in closure
        .iter()
        .filter(|entity| !roots.contains(&entity.tech_id))
    {
        for edge in source.parent_edges(entity.tech_id)? {
            if covered.contains(&edge.parent) {
                continue;
            }
            let Some(owner) = active_entity(source, edge.parent)? else {
                continue;
            };
            let relation = match edge.kind {
                EdgeKind::BelongsTo => "belongs to",
                EdgeKind::ComponentOf => "is a component of",
            };
            return Err(TrashError::Validation(format!(
                "The {} {} {relation} the {} {} which is outside the deletion set.",
                entity.kind.label(),
                entity.identifier(),
                owner.kind.label(),
                owner.identifier()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{resolve_cascade, CascadeSource};
    use crate::auth::session::{Role, Session};
    use crate::model::deletion::DeletionId;
    use crate::model::edge::{EdgeKind, RelationshipEdge};
    use crate::model::entity::{Entity, EntityKind, EntityState, PermId, Properties, TechId};
    use crate::repo::RepoResult;
    use crate::service::error::{NotFoundTarget, TrashError};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeStore {
        entities: BTreeMap<TechId, Entity>,
        edges: Vec<RelationshipEdge>,
    }

    impl FakeStore {
        fn add(&mut self, tech_id: TechId, kind: EntityKind, code: &str, space: &str) -> PermId {
            let perm_id = Uuid::new_v4();
            let space = match kind {
                EntityKind::Material => None,
                _ => Some(space.to_string()),
            };
            self.entities.insert(
                tech_id,
                Entity {
                    tech_id,
                    perm_id,
                    kind,
                    code: code.to_string(),
                    space,
                    state: EntityState::Active,
                    properties: Properties::new(),
                    deletion_id: None,
                    created_at: 0,
                    updated_at: 0,
                },
            );
            perm_id
        }

        fn link(&mut self, child: TechId, parent: TechId, kind: EdgeKind) {
            self.edges.push(RelationshipEdge {
                child,
                parent,
                kind,
            });
        }

        fn tombstone(&mut self, tech_id: TechId) {
            let entity = self.entities.get_mut(&tech_id).expect("known entity");
            entity.state = EntityState::Deleted;
            entity.deletion_id = Some(DeletionId::from_raw(1));
        }
    }

    impl CascadeSource for FakeStore {
        fn entity_by_perm_id(&self, perm_id: PermId) -> RepoResult<Option<Entity>> {
            Ok(self
                .entities
                .values()
                .find(|entity| entity.perm_id == perm_id)
                .cloned())
        }

        fn entity_by_tech_id(&self, tech_id: TechId) -> RepoResult<Option<Entity>> {
            Ok(self.entities.get(&tech_id).cloned())
        }

        fn child_edges(&self, parent: TechId) -> RepoResult<Vec<RelationshipEdge>> {
            Ok(self
                .edges
                .iter()
                .filter(|edge| edge.parent == parent)
                .copied()
                .collect())
        }

        fn parent_edges(&self, child: TechId) -> RepoResult<Vec<RelationshipEdge>> {
            Ok(self
                .edges
                .iter()
                .filter(|edge| edge.child == child)
                .copied()
                .collect())
        }

        fn active_space_members(&self, space: &str) -> RepoResult<Vec<TechId>> {
            Ok(self
                .entities
                .values()
                .filter(|entity| {
                    entity.kind != EntityKind::Space
                        && entity.is_active()
                        && entity.space.as_deref() == Some(space)
                })
                .map(|entity| entity.tech_id)
                .collect())
        }
    }

    fn admin() -> Session {
        Session::instance_admin("admin")
    }

    #[test]
    fn experiment_cascades_to_sample_and_data_set() {
        let mut store = FakeStore::default();
        let experiment = store.add(1, EntityKind::Experiment, "E1", "LAB");
        store.add(2, EntityKind::Sample, "S1", "LAB");
        store.add(3, EntityKind::DataSet, "DS1", "LAB");
        store.link(2, 1, EdgeKind::BelongsTo);
        store.link(3, 2, EdgeKind::BelongsTo);

        let plan = resolve_cascade(&store, &admin(), &[experiment]).unwrap();
        assert_eq!(plan.closure_ids(), vec![1, 2, 3]);
        assert_eq!(plan.requested_ids(), vec![1]);
    }

    #[test]
    fn diamond_is_deduplicated_and_parents_precede_children() {
        let mut store = FakeStore::default();
        let experiment = store.add(1, EntityKind::Experiment, "E1", "LAB");
        store.add(2, EntityKind::DataSet, "DS_COMPONENT", "LAB");
        store.add(3, EntityKind::DataSet, "DS_CONTAINER", "LAB");
        store.link(2, 1, EdgeKind::BelongsTo);
        store.link(3, 1, EdgeKind::BelongsTo);
        store.link(2, 3, EdgeKind::ComponentOf);

        let plan = resolve_cascade(&store, &admin(), &[experiment]).unwrap();
        assert_eq!(plan.closure_ids(), vec![1, 3, 2]);
    }

    #[test]
    fn equal_rank_entities_are_ordered_by_tech_id() {
        let mut store = FakeStore::default();
        let first = store.add(5, EntityKind::Sample, "S5", "LAB");
        let second = store.add(2, EntityKind::Sample, "S2", "LAB");
        store.add(9, EntityKind::Sample, "S9", "LAB");
        store.add(4, EntityKind::Sample, "S4", "LAB");
        store.link(9, 5, EdgeKind::ComponentOf);
        store.link(4, 2, EdgeKind::ComponentOf);

        let plan = resolve_cascade(&store, &admin(), &[first, second, first]).unwrap();
        assert_eq!(plan.closure_ids(), vec![2, 4, 5, 9]);
        assert_eq!(plan.requested_ids(), vec![5, 2]);
    }

    #[test]
    fn already_deleted_entities_are_not_reclaimed() {
        let mut store = FakeStore::default();
        let experiment = store.add(1, EntityKind::Experiment, "E1", "LAB");
        let sample = store.add(2, EntityKind::Sample, "S1", "LAB");
        store.link(2, 1, EdgeKind::BelongsTo);
        store.tombstone(2);

        let plan = resolve_cascade(&store, &admin(), &[experiment, sample]).unwrap();
        assert_eq!(plan.closure_ids(), vec![1]);
        assert_eq!(plan.requested_ids(), vec![1, 2]);
    }

    #[test]
    fn component_held_by_outside_container_is_released() {
        let mut store = FakeStore::default();
        let first = store.add(1, EntityKind::DataSet, "DS1", "LAB");
        store.add(2, EntityKind::DataSet, "DS2", "LAB");
        store.add(3, EntityKind::DataSet, "DS3", "LAB");
        store.add(4, EntityKind::DataSet, "DS4", "LAB");
        store.add(5, EntityKind::DataSet, "DS5", "LAB");
        store.link(3, 1, EdgeKind::ComponentOf);
        store.link(4, 1, EdgeKind::ComponentOf);
        store.link(4, 2, EdgeKind::ComponentOf);
        store.link(5, 4, EdgeKind::ComponentOf);

        let plan = resolve_cascade(&store, &admin(), &[first]).unwrap();
        assert_eq!(plan.closure_ids(), vec![1, 3]);
    }

    #[test]
    fn trashed_outside_container_does_not_hold_component() {
        let mut store = FakeStore::default();
        let first = store.add(1, EntityKind::DataSet, "DS1", "LAB");
        store.add(2, EntityKind::DataSet, "DS2", "LAB");
        store.add(3, EntityKind::DataSet, "DS3", "LAB");
        store.link(3, 1, EdgeKind::ComponentOf);
        store.link(3, 2, EdgeKind::ComponentOf);
        store.tombstone(2);

        let plan = resolve_cascade(&store, &admin(), &[first]).unwrap();
        assert_eq!(plan.closure_ids(), vec![1, 3]);
    }

    #[test]
    fn sample_owned_by_outside_experiment_blocks_deletion() {
        let mut store = FakeStore::default();
        let container = store.add(1, EntityKind::Sample, "S1", "LAB");
        store.add(2, EntityKind::Sample, "S2", "LAB");
        store.add(3, EntityKind::Experiment, "E2", "LAB");
        store.link(2, 1, EdgeKind::ComponentOf);
        store.link(2, 3, EdgeKind::BelongsTo);

        let err = resolve_cascade(&store, &admin(), &[container]).unwrap_err();
        assert!(matches!(
            err,
            TrashError::Validation(message) if message
                == "The sample /LAB/S2 belongs to the experiment /LAB/E2 which is outside the deletion set."
        ));
    }

    #[test]
    fn data_set_owned_inside_but_contained_outside_blocks_deletion() {
        let mut store = FakeStore::default();
        let experiment = store.add(1, EntityKind::Experiment, "E1", "LAB");
        store.add(2, EntityKind::DataSet, "DS1", "LAB");
        store.add(3, EntityKind::DataSet, "DS2", "LAB");
        store.link(2, 1, EdgeKind::BelongsTo);
        store.link(2, 3, EdgeKind::ComponentOf);

        let err = resolve_cascade(&store, &admin(), &[experiment]).unwrap_err();
        assert!(matches!(
            err,
            TrashError::Validation(message) if message.contains("is a component of the data set /LAB/DS2")
        ));
    }

    #[test]
    fn missing_requested_id_is_not_found() {
        let mut store = FakeStore::default();
        let experiment = store.add(1, EntityKind::Experiment, "E1", "LAB");
        let missing = Uuid::new_v4();

        let err = resolve_cascade(&store, &admin(), &[experiment, missing]).unwrap_err();
        assert!(matches!(err, TrashError::NotFound(NotFoundTarget::Entity(id)) if id == missing));
    }

    #[test]
    fn unauthorized_cascaded_entity_is_named() {
        let mut store = FakeStore::default();
        let experiment = store.add(1, EntityKind::Experiment, "E1", "LAB");
        store.add(2, EntityKind::Sample, "FOREIGN", "OTHER");
        store.link(2, 1, EdgeKind::BelongsTo);
        let session = Session::new("alice").with_space_role("LAB", Role::User);

        let err = resolve_cascade(&store, &session, &[experiment]).unwrap_err();
        match err {
            TrashError::Authorization(denied) => {
                assert_eq!(denied.entity.tech_id, 2);
                assert_eq!(denied.entity.identifier, "/OTHER/FOREIGN");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn space_with_outside_members_is_in_use() {
        let mut store = FakeStore::default();
        let space = store.add(1, EntityKind::Space, "LAB", "LAB");
        store.add(2, EntityKind::Experiment, "E1", "LAB");

        let err = resolve_cascade(&store, &admin(), &[space]).unwrap_err();
        assert!(matches!(err, TrashError::Validation(message) if message.contains("being used")));
    }

    #[test]
    fn empty_request_is_rejected() {
        let store = FakeStore::default();
        let err = resolve_cascade(&store, &admin(), &[]).unwrap_err();
        assert_eq!(err.code(), "validation");
    }
}
