use strata_types::{IndexId, SnapshotId};

use crate::metadata::SnapshotState;
use crate::repository_data::{RepositoryData, EMPTY_GEN};

fn snapshot(name: &str) -> SnapshotId {
    SnapshotId::new(name, format!("{name}-uuid"))
}

#[test]
fn empty_catalog_has_the_sentinel_generation() {
    let data = RepositoryData::empty();
    assert_eq!(data.generation(), EMPTY_GEN);
    assert_eq!(data.snapshot_ids().count(), 0);
    assert_eq!(data.indices().count(), 0);
}

#[test]
fn with_snapshot_registers_indices_once() {
    let docs = IndexId::new("docs", "docs-id");
    let logs = IndexId::new("logs", "logs-id");

    let one = snapshot("one");
    let two = snapshot("two");
    let data = RepositoryData::empty()
        .with_snapshot(&one, SnapshotState::Success, &[docs.clone(), logs.clone()])
        .with_snapshot(&two, SnapshotState::Success, std::slice::from_ref(&docs));

    assert_eq!(data.snapshot_ids().count(), 2);
    assert!(data.has_snapshot_name("one"));
    assert_eq!(data.indices().count(), 2);
    assert_eq!(data.resolve_index_id("docs").unwrap().id(), "docs-id");
    assert_eq!(data.snapshots_for_index("docs").unwrap().len(), 2);
    assert_eq!(data.snapshots_for_index("logs").unwrap().len(), 1);
}

#[test]
fn reregistering_an_index_keeps_the_assigned_id() {
    let one = snapshot("one");
    let two = snapshot("two");
    let data = RepositoryData::empty()
        .with_snapshot(&one, SnapshotState::Success, &[IndexId::new("docs", "original")])
        .with_snapshot(&two, SnapshotState::Success, &[IndexId::new("docs", "different")]);
    assert_eq!(data.resolve_index_id("docs").unwrap().id(), "original");
}

#[test]
fn without_snapshot_unlinks_and_prunes_indices() {
    let docs = IndexId::new("docs", "docs-id");
    let logs = IndexId::new("logs", "logs-id");
    let one = snapshot("one");
    let two = snapshot("two");
    let data = RepositoryData::empty()
        .with_snapshot(&one, SnapshotState::Success, &[docs.clone(), logs.clone()])
        .with_snapshot(&two, SnapshotState::Success, std::slice::from_ref(&docs));

    assert_eq!(data.indices_only_in(&one), vec![logs.clone()]);
    assert!(data.indices_only_in(&two).is_empty());

    let updated = data.without_snapshot(&one).unwrap();
    assert!(!updated.has_snapshot_name("one"));
    assert!(updated.resolve_index_id("logs").is_none());
    assert_eq!(updated.snapshots_for_index("docs").unwrap().len(), 1);
}

#[test]
fn without_unknown_snapshot_is_an_error() {
    let data = RepositoryData::empty();
    assert!(data.without_snapshot(&snapshot("ghost")).is_err());
}

#[test]
fn serialization_roundtrip_preserves_contents() {
    let docs = IndexId::new("docs", "docs-id");
    let one = snapshot("one");
    let data = RepositoryData::empty().with_snapshot(&one, SnapshotState::Partial, &[docs]);

    let bytes = data.to_bytes().unwrap();
    let parsed = RepositoryData::from_bytes("index-5", &bytes, 5).unwrap();
    assert_eq!(parsed.generation(), 5);
    assert_eq!(parsed.find_snapshot("one").unwrap().state, SnapshotState::Partial);
    assert_eq!(parsed.resolve_index_id("docs").unwrap().id(), "docs-id");
}

#[test]
fn garbage_catalog_payload_is_corrupt() {
    let err = RepositoryData::from_bytes("index-3", b"certainly not json", 3).unwrap_err();
    assert!(matches!(
        err,
        strata_types::RepositoryError::CorruptedRepository { .. }
    ));
}
