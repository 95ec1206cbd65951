//! Edits reach the owner's working copy on disk.

use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use yrs::{Doc, ReadTxn, Text, Transact};

use folio_collab::protocol::UserIdentity;
use folio_collab::{DocumentRegistry, RegistryConfig, CONTENT_FIELD};
use folio_core::{DocumentKey, FsProjectStore, ResourceId, UserId};

#[tokio::test]
async fn test_flush_writes_owner_copy() {
    let dir = tempdir().unwrap();
    let store = FsProjectStore::open(dir.path()).await.unwrap();
    let resource = ResourceId::from("thesis");
    let project_dir = store
        .register_project(resource.clone(), UserId::from("alice"))
        .await
        .unwrap();
    store.add_collaborator(&resource, UserId::from("bob")).await.unwrap();
    std::fs::write(project_dir.join("main.tex"), "draft").unwrap();

    let registry = DocumentRegistry::new(
        Arc::new(store),
        RegistryConfig {
            debounce_window: Duration::from_secs(3600),
            ..RegistryConfig::default()
        },
    );
    let key = DocumentKey::new(resource, "main.tex");
    let mut bob = registry
        .join(key.clone(), UserIdentity::new("bob", "Bob"))
        .await
        .unwrap();
    // Handshake: step 1, awareness, current users.
    for _ in 0..3 {
        bob.recv().await.unwrap();
    }

    // An empty local replica appending after the hydrated text.
    let local = Doc::new();
    let text = local.get_or_insert_text(CONTENT_FIELD);
    let before = local.transact().state_vector();
    {
        let mut txn = local.transact_mut();
        text.insert(&mut txn, 0, "final ");
    }
    let update = local.transact().encode_diff_v1(&before);
    bob.update(update).unwrap();

    let snapshot = loop {
        let snapshot = registry.snapshot(&key).await.unwrap();
        if snapshot.content.contains("final") {
            break snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(snapshot.content.contains("draft"));
    assert_eq!(registry.debouncer().pending(), 1);

    assert_eq!(registry.debouncer().flush_all().await, 1);
    let on_disk = std::fs::read_to_string(project_dir.join("main.tex")).unwrap();
    assert_eq!(on_disk, snapshot.content);
    assert!(!dir.path().join("bob").exists());
}
