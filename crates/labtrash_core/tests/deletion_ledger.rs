use labtrash_core::db::open_db_in_memory;
use labtrash_core::model::entity::{EntityDraft, EntityKind, Properties};
use labtrash_core::repo::deletion_repo::{DeletionLedger, DeletionListQuery, SqliteDeletionLedger};
use labtrash_core::repo::entity_repo::{EntityRepository, SqliteEntityRepository};
use labtrash_core::repo::RepoError;
use labtrash_core::DeletionId;

fn material(repo: &SqliteEntityRepository<'_>, code: &str) -> i64 {
    let draft = EntityDraft::new(EntityKind::Material, code, None, Properties::new()).unwrap();
    repo.create_entity(&draft).unwrap().tech_id
}

#[test]
fn record_keeps_entry_order_and_trims_reason() {
    let conn = open_db_in_memory().unwrap();
    let entities = SqliteEntityRepository::new(&conn);
    let ledger = SqliteDeletionLedger::new(&conn);
    let b = material(&entities, "B");
    let a = material(&entities, "A");
    let c = material(&entities, "C");

    let deletion_id = ledger
        .record_deletion(&[a], &[c, a, b], "  expired  ", "alice")
        .unwrap();
    let deletion = ledger.get_deletion(deletion_id).unwrap().unwrap();

    assert_eq!(deletion.reason, "expired");
    assert_eq!(deletion.actor, "alice");
    let original: Vec<_> = deletion.original_entities.iter().map(|e| e.tech_id).collect();
    assert_eq!(original, vec![a]);
    let cascaded: Vec<_> = deletion
        .cascaded_entities
        .iter()
        .map(|e| e.identifier.as_str())
        .collect();
    assert_eq!(cascaded, vec!["C", "A", "B"]);
}

#[test]
fn blank_reason_is_a_validation_error() {
    let conn = open_db_in_memory().unwrap();
    let ledger = SqliteDeletionLedger::new(&conn);

    let err = ledger.record_deletion(&[], &[], " ", "alice").unwrap_err();
    assert!(matches!(err, RepoError::Validation(_)));
}

#[test]
fn mark_reverted_is_one_way() {
    let conn = open_db_in_memory().unwrap();
    let ledger = SqliteDeletionLedger::new(&conn);
    let deletion_id = ledger.record_deletion(&[], &[], "cleanup", "alice").unwrap();

    ledger.mark_reverted(deletion_id, "bob").unwrap();
    let err = ledger.mark_reverted(deletion_id, "bob").unwrap_err();
    assert!(matches!(err, RepoError::DeletionNotFound(id) if id == deletion_id));

    let err = ledger
        .mark_reverted(DeletionId::from_raw(77), "bob")
        .unwrap_err();
    assert!(matches!(err, RepoError::DeletionNotFound(_)));
}

#[test]
fn list_pages_newest_first() {
    let conn = open_db_in_memory().unwrap();
    let ledger = SqliteDeletionLedger::new(&conn);
    let ids: Vec<_> = (0..3)
        .map(|n| {
            ledger
                .record_deletion(&[], &[], &format!("batch {n}"), "alice")
                .unwrap()
        })
        .collect();

    let page = ledger
        .list_deletions(&DeletionListQuery {
            include_reverted: false,
            limit: Some(2),
            offset: 1,
        })
        .unwrap();
    let listed: Vec<_> = page.iter().map(|deletion| deletion.deletion_id).collect();
    assert_eq!(listed, vec![ids[1], ids[0]]);
}
