//! Durable Store Integration Tests
//!
//! Responses and uploaded files on the filesystem backend, across restarts.

use kernelsanders::artifacts::artifact_key;
use kernelsanders::{ArtifactStore, FsBackend, ManualClock, ObjectBackend, ResponseStore, SharedBackend};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const RETENTION: Duration = Duration::from_secs(4 * 3600);

async fn open_backend(dir: &TempDir) -> SharedBackend {
    let path = dir.path().to_string_lossy().into_owned();
    Arc::new(FsBackend::open(&path).await.expect("Failed to open backend"))
}

#[tokio::test]
async fn test_responses_survive_restart() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let clock = ManualClock::starting_now();

    let (id, other) = {
        let store = ResponseStore::new(open_backend(&temp).await, RETENTION, clock.clone());
        let id = store.publish("# Hello\n\nfrom before the restart", 7).await;
        let other = store.publish("someone else", 8).await;
        (id, other)
    };

    clock.advance(Duration::from_secs(3600));

    let restarted = ResponseStore::new(open_backend(&temp).await, RETENTION, clock.clone());
    assert_eq!(restarted.load_all_from_backend().await.unwrap(), 2);

    let record = restarted.record(&id).await.unwrap();
    assert_eq!(record.content, "# Hello\n\nfrom before the restart");
    assert_eq!(record.owner_id, Some(7));
    assert_eq!(record.expires_at - record.created_at, chrono::Duration::hours(4));

    let mine = restarted.list_by_owner(7).await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, id);
    assert!(restarted.fetch(&other).await.is_some());
}

#[tokio::test]
async fn test_expired_responses_are_not_restored() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let clock = ManualClock::starting_now();

    let id = {
        let store = ResponseStore::new(open_backend(&temp).await, RETENTION, clock.clone());
        store.publish("short lived", 1).await
    };

    clock.advance(RETENTION + Duration::from_secs(1));

    let backend = open_backend(&temp).await;
    let restarted = ResponseStore::new(backend.clone(), RETENTION, clock.clone());
    restarted.load_all_from_backend().await.unwrap();

    assert!(restarted.fetch(&id).await.is_none());
    assert!(backend
        .get(&format!("web_responses/{}.json", id))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_uploaded_file_lifecycle() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let clock = ManualClock::starting_now();

    {
        let store = ArtifactStore::new(open_backend(&temp).await, RETENTION, clock.clone());
        let info = store.store_source_code(42, "fn main() {}").await.unwrap();
        assert_eq!(info.key, artifact_key(42, "source_code.txt"));
    }

    let backend = open_backend(&temp).await;
    let store = ArtifactStore::new(backend.clone(), RETENTION, clock.clone());
    assert_eq!(store.source_code(42).await.as_deref(), Some("fn main() {}"));

    let files = store.list_by_owner(42).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file_name, "source_code.txt");

    clock.advance(RETENTION + Duration::from_secs(1));
    assert!(store.source_code(42).await.is_none());
    assert_eq!(store.sweep().await, 1);
    assert!(backend.list("user_source_code/").await.unwrap().is_empty());
}
