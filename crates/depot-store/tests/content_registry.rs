//! Content and registry working together over one data root.

use depot_model::{ArtifactStore, ChangeSummary, StoreKey};
use depot_store::{
    ContentAccess, FileContentManager, FileStoreRegistry, MemoryNotFoundCache, NotFoundCache,
    StoreLayout, StoreRegistry, TransferFlags,
};
use std::io::Read;
use std::sync::Arc;

fn open(root: &std::path::Path) -> (Arc<FileStoreRegistry>, FileContentManager, Arc<MemoryNotFoundCache>) {
    let layout = StoreLayout::new(root);
    layout.initialize().unwrap();
    let registry = Arc::new(FileStoreRegistry::open(layout.clone()).unwrap());
    let nfc = Arc::new(MemoryNotFoundCache::new());
    let content = FileContentManager::new(layout, registry.clone(), nfc.clone());
    (registry, content, nfc)
}

#[test]
fn definitions_and_content_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let staging = StoreKey::hosted("maven", "staging");
    let public = StoreKey::group("maven", "public");
    {
        let (registry, content, _) = open(dir.path());
        let summary = ChangeSummary::new("alice", "initial setup");
        registry
            .save(ArtifactStore::hosted(staging.clone()), &summary)
            .unwrap();
        registry
            .save(ArtifactStore::group(public.clone(), vec![staging.clone()]), &summary)
            .unwrap();
        let store = registry.get(&staging).unwrap().unwrap();
        content
            .store(&store, "a/1.0/a.jar", &mut &b"jar-bytes"[..], TransferFlags::default())
            .unwrap();
    }

    let (registry, content, _) = open(dir.path());
    let group = registry.get(&public).unwrap().unwrap();
    let mut body = String::new();
    content
        .open_read(&group, "a/1.0/a.jar")
        .unwrap()
        .read_to_string(&mut body)
        .unwrap();
    assert_eq!(body, "jar-bytes");
}

#[test]
fn group_membership_update_is_copy_then_swap() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _, _) = open(dir.path());
    let public = StoreKey::group("maven", "public");
    let member = StoreKey::hosted("maven", "build-1");
    let summary = ChangeSummary::system("test");

    registry
        .save(ArtifactStore::group(public.clone(), vec![]), &summary)
        .unwrap();
    let before = registry.get(&public).unwrap().unwrap();
    registry
        .save(before.with_constituent(&member), &summary)
        .unwrap();

    assert!(before.constituents().is_empty());
    let after = registry.get(&public).unwrap().unwrap();
    assert_eq!(after.constituents(), &[member.clone()]);
    assert_eq!(registry.groups_affected_by(&member).unwrap()[0].key, public);
}

#[test]
fn storing_content_clears_a_recorded_miss() {
    let dir = tempfile::tempdir().unwrap();
    let (_, content, nfc) = open(dir.path());
    let hosted = ArtifactStore::hosted(StoreKey::hosted("maven", "staging"));
    assert!(content.retrieve(&hosted, "x.jar").unwrap().is_none());
    assert!(nfc.is_missing(&hosted.key, "x.jar"));
    content
        .store(&hosted, "x.jar", &mut &b"x"[..], TransferFlags::default())
        .unwrap();
    assert!(!nfc.is_missing(&hosted.key, "x.jar"));
}
