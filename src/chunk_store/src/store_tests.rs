use crate::ChunkStore;
use dfs_lib::{sha256_hex, DfsError};

async fn open_store(dir: &tempfile::TempDir) -> ChunkStore {
    ChunkStore::open(dir.path().join("store")).await.unwrap()
}

#[tokio::test]
async fn write_then_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let data = b"chunk payload".to_vec();
    let checksum = store
        .write_chunk("f_chunk_0", &data, None, false, false)
        .await
        .unwrap();
    assert_eq!(checksum, sha256_hex(&data));

    let read = store.read_chunk("f_chunk_0", true).await.unwrap();
    assert_eq!(read, data);
    assert!(store.chunk_exists("f_chunk_0").await);
    assert_eq!(store.chunk_count().await, 1);
}

#[tokio::test]
async fn bad_checksum_rejected_before_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let err = store
        .write_chunk("f_chunk_0", b"data", Some("deadbeef"), false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, DfsError::IntegrityFailure(_)));
    assert!(!store.chunk_exists("f_chunk_0").await);
    assert!(!dir.path().join("store/f_chunk_0").exists());
}

#[tokio::test]
async fn supplied_checksum_accepted_when_correct() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let data = b"verified".to_vec();
    let checksum = sha256_hex(&data);
    store
        .write_chunk("f_chunk_1", &data, Some(&checksum), true, false)
        .await
        .unwrap();

    let sidecar = store.load_sidecar("f_chunk_1").await.unwrap();
    assert_eq!(sidecar.checksum, checksum);
    assert!(sidecar.is_encrypted);
    assert!(!sidecar.is_erasure_coded);
}

#[tokio::test]
async fn corrupted_bytes_fail_verified_read() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    store
        .write_chunk("f_chunk_0", b"original", None, false, false)
        .await
        .unwrap();

    // Flip the on-disk bytes behind the store's back.
    std::fs::write(dir.path().join("store/f_chunk_0"), vec![0xFF; 8]).unwrap();

    let err = store.read_chunk("f_chunk_0", true).await.unwrap_err();
    assert!(matches!(err, DfsError::IntegrityFailure(_)));

    // Unverified read still hands the bytes back.
    let raw = store.read_chunk("f_chunk_0", false).await.unwrap();
    assert_eq!(raw, vec![0xFF; 8]);

    let (valid, _) = store.check_integrity("f_chunk_0").await.unwrap();
    assert!(!valid);
}

#[tokio::test]
async fn delete_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    store
        .write_chunk("f_chunk_0", b"bytes", None, false, false)
        .await
        .unwrap();
    store.delete_chunk("f_chunk_0").await.unwrap();

    assert!(!store.chunk_exists("f_chunk_0").await);
    assert!(!dir.path().join("store/f_chunk_0").exists());
    assert!(!dir.path().join("store/f_chunk_0.meta").exists());
    assert!(matches!(
        store.delete_chunk("f_chunk_0").await,
        Err(DfsError::NotFound(_))
    ));
}

#[tokio::test]
async fn rewrite_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    store
        .write_chunk("f_chunk_0", b"v1", None, false, false)
        .await
        .unwrap();
    store
        .write_chunk("f_chunk_0", b"v2", None, false, false)
        .await
        .unwrap();

    assert_eq!(store.read_chunk("f_chunk_0", true).await.unwrap(), b"v2");
    assert_eq!(store.chunk_count().await, 1);
}

#[tokio::test]
async fn path_traversal_ids_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    for bad in ["../escape", "a/b", ""] {
        assert!(matches!(
            store.write_chunk(bad, b"x", None, false, false).await,
            Err(DfsError::InvalidArgument(_))
        ));
    }
}

#[tokio::test]
async fn index_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let data = b"persisted".to_vec();
    {
        let store = open_store(&dir).await;
        store
            .write_chunk("f_chunk_0", &data, None, false, false)
            .await
            .unwrap();
        store.save_index().await.unwrap();
    }

    let store = open_store(&dir).await;
    assert!(store.chunk_exists("f_chunk_0").await);
    assert_eq!(store.read_chunk("f_chunk_0", true).await.unwrap(), data);
}

#[tokio::test]
async fn sidecar_wins_over_stale_index() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(&dir).await;
        store
            .write_chunk("f_chunk_0", b"payload", None, false, false)
            .await
            .unwrap();
        store.save_index().await.unwrap();
    }

    // Corrupt the summary index entry; the sidecar still holds the truth.
    let index_path = dir.path().join("store/checksums.json");
    let mut index: std::collections::HashMap<String, String> =
        serde_json::from_slice(&std::fs::read(&index_path).unwrap()).unwrap();
    index.insert("f_chunk_0".to_string(), "0".repeat(64));
    std::fs::write(&index_path, serde_json::to_vec(&index).unwrap()).unwrap();

    let store = open_store(&dir).await;
    assert_eq!(
        store.chunk_checksum("f_chunk_0").await.unwrap(),
        sha256_hex(b"payload")
    );
    assert!(store.read_chunk("f_chunk_0", true).await.is_ok());
}

#[tokio::test]
async fn missing_data_file_dropped_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(&dir).await;
        store
            .write_chunk("f_chunk_0", b"gone soon", None, false, false)
            .await
            .unwrap();
        store.save_index().await.unwrap();
    }

    std::fs::remove_file(dir.path().join("store/f_chunk_0")).unwrap();

    let store = open_store(&dir).await;
    assert!(!store.chunk_exists("f_chunk_0").await);
}

#[tokio::test]
async fn scan_purges_corruption_and_reports_it() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    store
        .write_chunk("good", b"fine", None, false, false)
        .await
        .unwrap();
    store
        .write_chunk("bad", b"doomed", None, false, false)
        .await
        .unwrap();
    store
        .write_chunk("vanished", b"poof", None, false, false)
        .await
        .unwrap();

    std::fs::write(dir.path().join("store/bad"), b"tampered").unwrap();
    std::fs::remove_file(dir.path().join("store/vanished")).unwrap();

    let report = store.scan().await.unwrap();
    assert_eq!(report.corrupted, vec!["bad".to_string()]);
    assert_eq!(report.missing, vec!["vanished".to_string()]);

    assert!(store.chunk_exists("good").await);
    assert!(!store.chunk_exists("bad").await);
    assert!(!store.chunk_exists("vanished").await);
    assert!(!dir.path().join("store/bad").exists());
}

#[tokio::test]
async fn storage_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    store
        .write_chunk("a", &vec![0u8; 100], None, false, false)
        .await
        .unwrap();
    store
        .write_chunk("b", &vec![0u8; 50], None, false, false)
        .await
        .unwrap();

    assert_eq!(store.total_storage_used().await, 150);
    assert!(store.total_space() >= store.free_space());
}
