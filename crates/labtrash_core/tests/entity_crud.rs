use labtrash_core::db::open_db_in_memory;
use labtrash_core::{
    DeletionService, EdgeKind, EntityKind, EntityListQuery, EntityService, NewEntity,
    NotFoundTarget, Properties, Role, Session, TrashError,
};
use rusqlite::Connection;
use uuid::Uuid;

fn setup() -> Connection {
    let conn = open_db_in_memory().unwrap();
    EntityService::new(&conn)
        .create_entity(&admin(), NewEntity::new(EntityKind::Space, "lab"))
        .unwrap();
    conn
}

fn admin() -> Session {
    Session::instance_admin("admin")
}

#[test]
fn create_normalizes_code_and_renders_identifier() {
    let conn = setup();
    let service = EntityService::new(&conn);

    let experiment = service
        .create_entity(
            &admin(),
            NewEntity::new(EntityKind::Experiment, " exp_1 ")
                .in_space("lab")
                .with_property("temperature", "37C"),
        )
        .unwrap();

    assert_eq!(experiment.code, "EXP_1");
    assert_eq!(experiment.identifier(), "/LAB/EXP_1");
    assert!(experiment.is_active());
    assert_eq!(experiment.properties.get("temperature").unwrap(), "37C");

    let loaded = service.get_entity(&admin(), experiment.perm_id, false).unwrap();
    assert_eq!(loaded, experiment);
}

#[test]
fn create_rejects_missing_space_and_duplicate_code() {
    let conn = setup();
    let service = EntityService::new(&conn);

    let err = service
        .create_entity(
            &admin(),
            NewEntity::new(EntityKind::Sample, "S1").in_space("NOWHERE"),
        )
        .unwrap_err();
    assert!(matches!(err, TrashError::Validation(message) if message.contains("/NOWHERE")));

    service
        .create_entity(&admin(), NewEntity::new(EntityKind::Sample, "S1").in_space("LAB"))
        .unwrap();
    let err = service
        .create_entity(&admin(), NewEntity::new(EntityKind::Sample, "s1").in_space("LAB"))
        .unwrap_err();
    assert!(matches!(err, TrashError::Validation(message) if message.contains("already exists")));
}

#[test]
fn trashed_codes_stay_reserved() {
    let conn = setup();
    let entities = EntityService::new(&conn);
    let material = entities
        .create_entity(&admin(), NewEntity::new(EntityKind::Material, "glucose"))
        .unwrap();
    DeletionService::new(&conn)
        .delete_entities(&admin(), &[material.perm_id], "expired batch")
        .unwrap();

    let err = entities
        .create_entity(&admin(), NewEntity::new(EntityKind::Material, "GLUCOSE"))
        .unwrap_err();
    assert_eq!(err.code(), "validation");
}

#[test]
fn create_with_illegal_edge_kind_is_rejected() {
    let conn = setup();
    let service = EntityService::new(&conn);
    let sample = service
        .create_entity(&admin(), NewEntity::new(EntityKind::Sample, "S1").in_space("LAB"))
        .unwrap();

    let err = service
        .create_entity(
            &admin(),
            NewEntity::new(EntityKind::Experiment, "E1")
                .in_space("LAB")
                .with_parent(sample.perm_id, EdgeKind::BelongsTo),
        )
        .unwrap_err();
    assert!(matches!(err, TrashError::Validation(_)));
    assert!(service
        .search_entities(
            &admin(),
            &EntityListQuery {
                kind: Some(EntityKind::Experiment),
                ..EntityListQuery::default()
            }
        )
        .unwrap()
        .is_empty());
}

#[test]
fn write_requires_user_role_in_space() {
    let conn = setup();
    let service = EntityService::new(&conn);
    let observer = Session::new("olga").with_space_role("LAB", Role::Observer);

    let err = service
        .create_entity(&observer, NewEntity::new(EntityKind::Sample, "S1").in_space("LAB"))
        .unwrap_err();
    match err {
        TrashError::Authorization(denied) => {
            assert_eq!(denied.actor, "olga");
            assert_eq!(denied.required, Role::User);
            assert_eq!(denied.entity.identifier, "/LAB/S1");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn update_properties_replaces_bag_and_freezes_trashed_entities() {
    let conn = setup();
    let service = EntityService::new(&conn);
    let sample = service
        .create_entity(
            &admin(),
            NewEntity::new(EntityKind::Sample, "S1")
                .in_space("LAB")
                .with_property("volume", "5ml"),
        )
        .unwrap();

    let mut properties = Properties::new();
    properties.insert("volume".to_string(), "4ml".to_string());
    properties.insert("owner".to_string(), "alice".to_string());
    let updated = service
        .update_properties(&admin(), sample.perm_id, properties.clone())
        .unwrap();
    assert_eq!(updated.properties, properties);

    DeletionService::new(&conn)
        .delete_entities(&admin(), &[sample.perm_id], "contaminated")
        .unwrap();
    let err = service
        .update_properties(&admin(), sample.perm_id, Properties::new())
        .unwrap_err();
    assert!(
        matches!(err, TrashError::NotFound(NotFoundTarget::Entity(id)) if id == sample.perm_id)
    );
}

#[test]
fn link_rejects_cycles_and_unlink_requires_edge() {
    let conn = setup();
    let service = EntityService::new(&conn);
    let outer = service
        .create_entity(&admin(), NewEntity::new(EntityKind::Sample, "OUTER").in_space("LAB"))
        .unwrap();
    let inner = service
        .create_entity(
            &admin(),
            NewEntity::new(EntityKind::Sample, "INNER")
                .in_space("LAB")
                .with_parent(outer.perm_id, EdgeKind::ComponentOf),
        )
        .unwrap();

    let err = service
        .link(&admin(), outer.perm_id, inner.perm_id, EdgeKind::ComponentOf)
        .unwrap_err();
    assert!(matches!(err, TrashError::Validation(message) if message.contains("cycle")));

    let added = service
        .link(&admin(), inner.perm_id, outer.perm_id, EdgeKind::ComponentOf)
        .unwrap();
    assert!(!added);

    service
        .unlink(&admin(), inner.perm_id, outer.perm_id, EdgeKind::ComponentOf)
        .unwrap();
    let err = service
        .unlink(&admin(), inner.perm_id, outer.perm_id, EdgeKind::ComponentOf)
        .unwrap_err();
    assert_eq!(err.code(), "validation");
}

#[test]
fn children_and_parents_follow_edges() {
    let conn = setup();
    let service = EntityService::new(&conn);
    let experiment = service
        .create_entity(&admin(), NewEntity::new(EntityKind::Experiment, "E1").in_space("LAB"))
        .unwrap();
    let sample = service
        .create_entity(
            &admin(),
            NewEntity::new(EntityKind::Sample, "S1")
                .in_space("LAB")
                .with_parent(experiment.perm_id, EdgeKind::BelongsTo),
        )
        .unwrap();

    let children = service.list_children(&admin(), experiment.perm_id).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].0, EdgeKind::BelongsTo);
    assert_eq!(children[0].1.perm_id, sample.perm_id);

    let parents = service.list_parents(&admin(), sample.perm_id).unwrap();
    assert_eq!(parents.len(), 1);
    assert_eq!(parents[0].1.perm_id, experiment.perm_id);
}

#[test]
fn list_entities_keeps_request_order_and_skips_unknown_or_invisible() {
    let conn = setup();
    let service = EntityService::new(&conn);
    service
        .create_entity(&admin(), NewEntity::new(EntityKind::Space, "OTHER"))
        .unwrap();
    let first = service
        .create_entity(&admin(), NewEntity::new(EntityKind::Sample, "A").in_space("LAB"))
        .unwrap();
    let second = service
        .create_entity(&admin(), NewEntity::new(EntityKind::Sample, "B").in_space("LAB"))
        .unwrap();
    let hidden = service
        .create_entity(&admin(), NewEntity::new(EntityKind::Sample, "C").in_space("OTHER"))
        .unwrap();

    let reader = Session::new("rita").with_space_role("LAB", Role::Observer);
    let listed = service
        .list_entities(
            &reader,
            &[second.perm_id, Uuid::new_v4(), hidden.perm_id, first.perm_id],
            false,
        )
        .unwrap();
    let ids: Vec<_> = listed.iter().map(|entity| entity.perm_id).collect();
    assert_eq!(ids, vec![second.perm_id, first.perm_id]);
}

#[test]
fn get_entity_hides_entities_outside_granted_spaces() {
    let conn = setup();
    let service = EntityService::new(&conn);
    let sample = service
        .create_entity(&admin(), NewEntity::new(EntityKind::Sample, "S1").in_space("LAB"))
        .unwrap();

    let stranger = Session::new("sam").with_space_role("OTHER", Role::Admin);
    let err = service.get_entity(&stranger, sample.perm_id, true).unwrap_err();
    assert!(matches!(err, TrashError::NotFound(_)));
}
