//! Behavior every `ContentStore` backend must share.

use storyvault::errors::StorageError;
use storyvault::store::{ContentStore, FilesystemStore, ListOptions, ObjectContentStore, PutOptions};
use tempfile::TempDir;

async fn round_trip(store: &dyn ContentStore) {
    let key = "stories/2024/01/round-trip.md";
    assert_eq!(store.get(key).await.unwrap(), None);
    assert!(!store.exists(key).await.unwrap());

    store.put(key, "hello world", PutOptions::default()).await.unwrap();
    assert_eq!(store.get(key).await.unwrap().as_deref(), Some("hello world"));
    assert!(store.exists(key).await.unwrap());

    // unconditional overwrite
    store.put(key, "second draft", PutOptions::default()).await.unwrap();
    assert_eq!(store.get(key).await.unwrap().as_deref(), Some("second draft"));

    assert!(store.delete(key).await.unwrap());
    assert_eq!(store.get(key).await.unwrap(), None);
    assert!(!store.exists(key).await.unwrap());
    assert!(!store.delete(key).await.unwrap());
}

async fn metadata_without_content(store: &dyn ContentStore) {
    let key = "stories/meta.md";
    assert_eq!(store.get_metadata(key).await.unwrap(), None);

    store
        .put(key, "ünïcode text", PutOptions::default().with_metadata("author-did", "did:plc:a"))
        .await
        .unwrap();
    let meta = store.get_metadata(key).await.unwrap().unwrap();
    assert_eq!(meta.key, key);
    assert_eq!(meta.size, "ünïcode text".len() as u64);
    assert_eq!(meta.content_type, "text/markdown; charset=utf-8");
    assert_eq!(
        meta.metadata.get("author-did").map(String::as_str),
        Some("did:plc:a")
    );
    store.delete(key).await.unwrap();
}

async fn listing_pages_with_tokens(store: &dyn ContentStore) {
    let keys = [
        "stories/2024/01/a.md",
        "stories/2024/01/b.md",
        "stories/2024/02/c.md",
        "stories/2024/02/d.md",
        "stories/2025/01/e.md",
        "drafts/x.md",
    ];
    for key in keys {
        store.put(key, key, PutOptions::default()).await.unwrap();
    }

    let mut seen = Vec::new();
    let mut token = None;
    loop {
        let page = store
            .list(ListOptions::prefix("stories/2024/").max_keys(3).after(token))
            .await
            .unwrap();
        assert!(page.files.len() <= 3);
        seen.extend(page.files.into_iter().map(|f| f.key));
        if !page.has_more {
            assert!(page.continuation_token.is_none());
            break;
        }
        token = page.continuation_token;
        assert!(token.is_some());
    }
    assert_eq!(seen, &keys[..4]);

    // prefixes are plain strings, not path segments
    let partial = store
        .list(ListOptions::prefix("stories/2024/0"))
        .await
        .unwrap();
    assert_eq!(partial.files.len(), 4);
    assert!(!partial.has_more);

    let all = store.list(ListOptions::default()).await.unwrap();
    let all_keys: Vec<_> = all.files.iter().map(|f| f.key.as_str()).collect();
    let mut sorted = keys.to_vec();
    sorted.sort();
    assert_eq!(all_keys, sorted);

    let err = store
        .list(ListOptions::default().after(Some("bogus".into())))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Validation(_)));

    for key in keys {
        store.delete(key).await.unwrap();
    }
}

async fn rejects_unsafe_keys(store: &dyn ContentStore) {
    for key in ["", "/abs.md", "../up.md", "a/../b.md", "a/./b.md", "back\\slash"] {
        let err = store.put(key, "x", PutOptions::default()).await.unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)), "{:?}", key);
    }
}

async fn run_contract(store: &dyn ContentStore) {
    round_trip(store).await;
    metadata_without_content(store).await;
    listing_pages_with_tokens(store).await;
    rejects_unsafe_keys(store).await;
}

#[tokio::test]
async fn filesystem_store_honors_the_contract() {
    let tmp = TempDir::new().unwrap();
    let store = FilesystemStore::new(tmp.path().join("stories")).await.unwrap();
    run_contract(&store).await;
}

#[tokio::test]
async fn in_memory_object_store_honors_the_contract() {
    let store = ObjectContentStore::in_memory();
    run_contract(&store).await;
}

#[tokio::test]
async fn tokens_do_not_cross_backends() {
    let tmp = TempDir::new().unwrap();
    let fs = FilesystemStore::new(tmp.path()).await.unwrap();
    let mem = ObjectContentStore::in_memory();
    for key in ["a.md", "b.md"] {
        fs.put(key, key, PutOptions::default()).await.unwrap();
        mem.put(key, key, PutOptions::default()).await.unwrap();
    }

    let fs_page = fs.list(ListOptions::default().max_keys(1)).await.unwrap();
    let token = fs_page.continuation_token.clone();
    assert!(token.is_some());
    let err = mem
        .list(ListOptions::default().max_keys(1).after(token))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Validation(_)));
}
