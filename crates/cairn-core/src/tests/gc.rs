use std::sync::Arc;

use cairn_types::blob_id::BlobId;
use cairn_types::content_id::ContentId;
use chrono::Duration;

use crate::error::CairnError;
use crate::fs::SourceEntry;
use crate::gc::{run, SafetyParameters};
use crate::index::ContentInfo;
use crate::policy::{Policy, PolicyTree};
use crate::repo::{MaintenanceRepository, RepositoryWriter};
use crate::snapshot::SnapshotManifest;
use crate::testutil::{test_source_info, TestDirectory, TestRepository};
use crate::upload::Uploader;

fn id(s: &str) -> ContentId {
    ContentId::parse(s).unwrap()
}

fn unreferenced_content(content_id: &str, age: Duration, repo: &Arc<TestRepository>) -> ContentInfo {
    ContentInfo {
        content_id: id(content_id),
        timestamp_seconds: (repo.time() - age).timestamp(),
        pack_blob_id: BlobId::from("px"),
        pack_offset: 0,
        original_length: 64,
        packed_length: 48,
        compression_header_id: 0,
        format_version: 1,
        encryption_key_id: 0,
        deleted: false,
    }
}

/// Upload a small tree and publish its snapshot manifest.
fn publish_snapshot(repo: &Arc<TestRepository>) -> SnapshotManifest {
    let mut uploader = Uploader::new(repo.clone());
    uploader.parallel_uploads = 1;
    uploader.disable_estimation = true;

    let root = TestDirectory::new("root");
    root.add_file("a.txt", b"live content a");
    let sub = root.add_dir("sub");
    sub.add_file("b.txt", b"live content b");

    let manifest = uploader
        .upload(
            SourceEntry::Directory(root),
            &PolicyTree::single(Policy::default()),
            test_source_info(),
            &[],
        )
        .unwrap();
    repo.save_snapshot(&manifest).unwrap();
    manifest
}

#[test]
fn referenced_deleted_contents_are_undeleted() {
    let repo = TestRepository::new();
    let manifest = publish_snapshot(&repo);

    // Mark the root directory's content deleted, as a previous sweep would.
    let root_oid = manifest.root_object_id().unwrap().clone();
    let root_content = repo.verify_object(&root_oid).unwrap()[0].clone();
    repo.delete_content(&root_content).unwrap();
    assert!(repo.content(&root_content).unwrap().deleted);

    let stats = run(repo.as_ref(), true, SafetyParameters::none()).unwrap();

    assert_eq!(stats.undeleted_count, 1);
    assert!(!repo.content(&root_content).unwrap().deleted);
    assert!(stats.in_use_count > 0);
    assert_eq!(stats.unused_count, 0);
}

#[test]
fn unreferenced_old_contents_are_deleted() {
    let repo = TestRepository::new();
    publish_snapshot(&repo);

    repo.put_content(unreferenced_content("0af0af", Duration::hours(48), &repo));

    let stats = run(repo.as_ref(), true, SafetyParameters::full()).unwrap();

    assert_eq!(stats.unused_count, 1);
    assert_eq!(stats.unused_bytes, 48);
    assert!(repo.content(&id("0af0af")).unwrap().deleted);
}

#[test]
fn safety_window_protects_recent_contents() {
    let repo = TestRepository::new();
    publish_snapshot(&repo);

    // Unreferenced but only 10 minutes old with a 1-hour window.
    repo.put_content(unreferenced_content("0af0af", Duration::minutes(10), &repo));

    let safety = SafetyParameters {
        min_content_age_subject_to_gc: Duration::hours(1),
    };
    let stats = run(repo.as_ref(), true, safety).unwrap();

    assert_eq!(stats.too_recent_count, 1);
    assert_eq!(stats.unused_count, 0);
    assert!(!repo.content(&id("0af0af")).unwrap().deleted);
}

#[test]
fn dry_run_reports_would_delete() {
    let repo = TestRepository::new();
    publish_snapshot(&repo);

    repo.put_content(unreferenced_content("0af0af", Duration::hours(48), &repo));

    let err = run(repo.as_ref(), false, SafetyParameters::none()).unwrap_err();
    assert!(matches!(err, CairnError::WouldDelete { count: 1, .. }));

    // Nothing was actually deleted.
    assert!(!repo.content(&id("0af0af")).unwrap().deleted);
}

#[test]
fn manifest_system_contents_are_never_collected() {
    let repo = TestRepository::new();
    publish_snapshot(&repo);

    // Unreferenced and old, but carrying the manifest-system prefix.
    repo.put_content(unreferenced_content("m0af0af", Duration::hours(48), &repo));

    let stats = run(repo.as_ref(), true, SafetyParameters::none()).unwrap();

    assert_eq!(stats.system_count, 1);
    assert_eq!(stats.unused_count, 0);
    assert!(!repo.content(&id("m0af0af")).unwrap().deleted);
}

#[test]
fn all_live_contents_survive_a_deleting_run() {
    let repo = TestRepository::new();
    let manifest = publish_snapshot(&repo);

    let stats = run(repo.as_ref(), true, SafetyParameters::none()).unwrap();
    assert_eq!(stats.unused_count, 0);
    assert!(stats.in_use_count >= 4); // two files, two directory manifests

    // The whole tree remains readable.
    let root_oid = manifest.root_object_id().unwrap();
    for content_id in repo.verify_object(root_oid).unwrap() {
        assert!(!repo.content(&content_id).unwrap().deleted);
    }
}
