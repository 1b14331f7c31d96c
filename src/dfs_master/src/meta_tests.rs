use crate::MetadataManager;
use dfs_lib::{now_ms, ChunkMeta, DfsError, FileMeta, HeartbeatRequest, ServerMeta};
use std::collections::HashSet;

fn manager(dir: &tempfile::TempDir) -> MetadataManager {
    MetadataManager::open(dir.path().join("master_metadata.json")).unwrap()
}

fn file(filename: &str, file_id: &str, size: u64) -> FileMeta {
    let now = now_ms();
    FileMeta {
        file_id: file_id.to_string(),
        filename: filename.to_string(),
        size,
        created_time: now,
        modified_time: now,
        is_encrypted: false,
        encryption_key_id: String::new(),
        is_erasure_coded: false,
        chunk_ids: Vec::new(),
        completed: false,
    }
}

fn chunk(chunk_id: &str, locations: &[&str]) -> ChunkMeta {
    let now = now_ms();
    ChunkMeta {
        chunk_id: chunk_id.to_string(),
        size: 1024,
        checksum: String::new(),
        is_erasure_coded: false,
        erasure_group_id: String::new(),
        erasure_block_index: 0,
        is_parity_block: false,
        server_locations: locations.iter().map(|s| s.to_string()).collect(),
        created_time: now,
        last_accessed_time: now,
    }
}

fn server(server_id: &str, port: u16) -> ServerMeta {
    ServerMeta {
        server_id: server_id.to_string(),
        address: "127.0.0.1".to_string(),
        port,
        zone: "default".to_string(),
        total_space: 1 << 30,
        free_space: 1 << 30,
        chunk_count: 0,
        cpu_usage: 0.0,
        memory_usage: 0.0,
        is_healthy: true,
        last_heartbeat: now_ms(),
        stored_chunks: HashSet::new(),
    }
}

fn heartbeat_with(server_id: &str, stored: &[&str]) -> HeartbeatRequest {
    HeartbeatRequest {
        server_id: server_id.to_string(),
        free_space: 1 << 29,
        chunk_count: stored.len() as u64,
        cpu_usage: 0.1,
        memory_usage: 0.2,
        stored_chunks: stored.iter().map(|s| s.to_string()).collect(),
    }
}

#[test]
fn create_file_rejects_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let meta = manager(&dir);

    meta.create_file(file("/a", "file_1", 10)).unwrap();
    let err = meta.create_file(file("/a", "file_2", 10)).unwrap_err();
    assert!(matches!(err, DfsError::AlreadyExists(_)));
    assert_eq!(meta.get_file("/a").unwrap().file_id, "file_1");
    assert_eq!(meta.file_by_id("file_1").unwrap().filename, "/a");
}

#[test]
fn delete_file_cascades_to_chunks_and_schedules_deletions() {
    let dir = tempfile::tempdir().unwrap();
    let meta = manager(&dir);

    meta.register_server(server("s1", 7001)).unwrap();
    meta.register_server(server("s2", 7002)).unwrap();
    meta.create_file(file("/a", "file_1", 2048)).unwrap();
    meta.add_chunk(chunk("file_1_chunk_0", &["s1", "s2"])).unwrap();
    meta.add_chunk(chunk("file_1_chunk_1", &["s2"])).unwrap();
    meta.append_file_chunks(
        "file_1",
        &["file_1_chunk_0".to_string(), "file_1_chunk_1".to_string()],
    )
    .unwrap();

    meta.delete_file("/a").unwrap();
    assert!(meta.get_file("/a").is_none());
    assert!(meta.get_chunk("file_1_chunk_0").is_none());

    // Deletions ride the next heartbeat of each holder.
    let (_, deletes) = meta.heartbeat(&heartbeat_with("s2", &[])).unwrap();
    let deletes: HashSet<String> = deletes.into_iter().collect();
    assert!(deletes.contains("file_1_chunk_0"));
    assert!(deletes.contains("file_1_chunk_1"));

    let (_, deletes) = meta.heartbeat(&heartbeat_with("s1", &[])).unwrap();
    assert_eq!(deletes, vec!["file_1_chunk_0".to_string()]);
}

#[test]
fn list_files_filters_by_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let meta = manager(&dir);

    meta.create_file(file("/logs/a", "file_1", 1)).unwrap();
    meta.create_file(file("/logs/b", "file_2", 1)).unwrap();
    meta.create_file(file("/data/c", "file_3", 1)).unwrap();

    assert_eq!(meta.list_files("").len(), 3);
    let logs = meta.list_files("/logs/");
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].filename, "/logs/a");
    assert!(meta.list_files("/nope").is_empty());
}

#[test]
fn complete_upload_requires_every_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let meta = manager(&dir);

    meta.create_file(file("/a", "file_1", 2048)).unwrap();
    meta.append_file_chunks(
        "file_1",
        &["file_1_chunk_0".to_string(), "file_1_chunk_1".to_string()],
    )
    .unwrap();

    let err = meta
        .mark_upload_complete("file_1", &["file_1_chunk_0".to_string()])
        .unwrap_err();
    assert!(matches!(err, DfsError::InvalidArgument(_)));
    assert!(!meta.get_file("/a").unwrap().completed);

    let sealed = meta
        .mark_upload_complete(
            "file_1",
            &["file_1_chunk_0".to_string(), "file_1_chunk_1".to_string()],
        )
        .unwrap();
    assert!(sealed.completed);
    assert!(sealed.modified_time >= sealed.created_time);
}

#[test]
fn heartbeat_confirms_new_copies_and_flags_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let meta = manager(&dir);

    meta.register_server(server("s1", 7001)).unwrap();
    meta.create_file(file("/a", "file_1", 1024)).unwrap();
    meta.add_chunk(chunk("file_1_chunk_0", &[])).unwrap();
    meta.append_file_chunks("file_1", &["file_1_chunk_0".to_string()])
        .unwrap();

    // s1 reports a chunk the master knows but never placed there: a
    // completed copy. It also reports an unknown id: an orphan.
    let (_, deletes) = meta
        .heartbeat(&heartbeat_with("s1", &["file_1_chunk_0", "ghost_chunk"]))
        .unwrap();
    assert_eq!(deletes, vec!["ghost_chunk".to_string()]);

    let chunk = meta.get_chunk("file_1_chunk_0").unwrap();
    assert_eq!(chunk.server_locations, vec!["s1".to_string()]);
    assert_eq!(meta.confirmed_holders("file_1_chunk_0"), vec!["s1".to_string()]);
}

#[test]
fn heartbeat_from_unknown_server_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let meta = manager(&dir);
    let err = meta.heartbeat(&heartbeat_with("nobody", &[])).unwrap_err();
    assert!(matches!(err, DfsError::NotFound(_)));
}

#[test]
fn replication_queue_deduplicates_and_fans_out() {
    let dir = tempfile::tempdir().unwrap();
    let meta = manager(&dir);
    meta.register_server(server("s1", 7001)).unwrap();
    meta.register_server(server("s2", 7002)).unwrap();

    let task = dfs_lib::ReplicationTask {
        chunk_id: "c1".to_string(),
        source_server: "s1".to_string(),
        source_address: "127.0.0.1:7001".to_string(),
        target_server: "s2".to_string(),
        target_address: "127.0.0.1:7002".to_string(),
        is_urgent: true,
        ec_repair: None,
    };
    meta.queue_replication(task.clone());
    meta.queue_replication(task);
    // One copy for the source, one for the target, no duplicates.
    assert_eq!(meta.pending_task_count(), 2);

    let (tasks, _) = meta.heartbeat(&heartbeat_with("s2", &[])).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].chunk_id, "c1");
    assert_eq!(meta.pending_task_count(), 1);
}

#[test]
fn unregister_strips_placements() {
    let dir = tempfile::tempdir().unwrap();
    let meta = manager(&dir);
    meta.register_server(server("s1", 7001)).unwrap();
    meta.register_server(server("s2", 7002)).unwrap();
    meta.add_chunk(chunk("c1", &["s1", "s2"])).unwrap();

    meta.unregister_server("s1").unwrap();
    assert!(meta.get_server("s1").is_none());
    assert_eq!(
        meta.get_chunk("c1").unwrap().server_locations,
        vec!["s2".to_string()]
    );
    assert!(meta.chunks_on_server("s1").is_empty());
}

#[test]
fn overdue_and_dead_server_detection() {
    let dir = tempfile::tempdir().unwrap();
    let meta = manager(&dir);

    let mut stale = server("s1", 7001);
    stale.last_heartbeat = now_ms().saturating_sub(60_000);
    meta.register_server(stale).unwrap();
    meta.register_server(server("s2", 7002)).unwrap();

    let overdue = meta.overdue_servers(15_000);
    assert_eq!(overdue, vec!["s1".to_string()]);

    meta.mark_server_unhealthy("s1");
    // Unhealthy for longer than 2x the timeout: unregistered entirely.
    let dead = meta.cleanup_dead_servers(15_000);
    assert_eq!(dead, vec!["s1".to_string()]);
    assert!(meta.get_server("s1").is_none());
    assert!(meta.get_server("s2").is_some());
}

#[test]
fn orphaned_chunks_are_cleaned() {
    let dir = tempfile::tempdir().unwrap();
    let meta = manager(&dir);
    meta.register_server(server("s1", 7001)).unwrap();

    meta.create_file(file("/a", "file_1", 1024)).unwrap();
    meta.add_chunk(chunk("file_1_chunk_0", &["s1"])).unwrap();
    meta.append_file_chunks("file_1", &["file_1_chunk_0".to_string()])
        .unwrap();
    meta.add_chunk(chunk("loose_chunk", &["s1"])).unwrap();

    assert_eq!(meta.cleanup_orphaned_chunks(), 1);
    assert!(meta.get_chunk("loose_chunk").is_none());
    assert!(meta.get_chunk("file_1_chunk_0").is_some());
}

#[test]
fn stale_uploads_are_swept() {
    let dir = tempfile::tempdir().unwrap();
    let meta = manager(&dir);

    let mut old = file("/stale", "file_1", 10);
    old.created_time = now_ms().saturating_sub(100_000);
    meta.create_file(old).unwrap();

    let mut sealed = file("/done", "file_2", 10);
    sealed.created_time = now_ms().saturating_sub(100_000);
    sealed.completed = true;
    meta.create_file(sealed).unwrap();

    let swept = meta.sweep_stale_uploads(50_000);
    assert_eq!(swept, vec!["/stale".to_string()]);
    assert!(meta.get_file("/stale").is_none());
    assert!(meta.get_file("/done").is_some());
}

#[test]
fn persistence_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    {
        let meta = manager(&dir);
        meta.register_server(server("s1", 7001)).unwrap();
        meta.create_file(file("/a", "file_1", 2048)).unwrap();
        meta.add_chunk(chunk("file_1_chunk_0", &["s1"])).unwrap();
        meta.append_file_chunks("file_1", &["file_1_chunk_0".to_string()])
            .unwrap();
        meta.mark_upload_complete("file_1", &["file_1_chunk_0".to_string()])
            .unwrap();
        meta.save().unwrap();
    }

    let restored = manager(&dir);
    let file = restored.get_file("/a").unwrap();
    assert!(file.completed);
    assert_eq!(file.chunk_ids, vec!["file_1_chunk_0".to_string()]);
    assert_eq!(
        restored.get_chunk("file_1_chunk_0").unwrap().server_locations,
        vec!["s1".to_string()]
    );
    assert_eq!(restored.chunks_on_server("s1"), vec!["file_1_chunk_0".to_string()]);
    assert_eq!(restored.get_server("s1").unwrap().port, 7001);
}

#[test]
fn statistics_summarize_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let meta = manager(&dir);

    let mut s1 = server("s1", 7001);
    s1.free_space = 1 << 29;
    meta.register_server(s1).unwrap();
    let mut s2 = server("s2", 7002);
    s2.is_healthy = false;
    meta.register_server(s2).unwrap();

    meta.create_file(file("/a", "file_1", 1024)).unwrap();
    meta.add_chunk(chunk("c1", &["s1"])).unwrap();
    meta.add_chunk(chunk("c2", &["s1", "s2"])).unwrap();

    let stats = meta.statistics();
    assert_eq!(stats.total_files, 1);
    assert_eq!(stats.total_chunks, 2);
    assert_eq!(stats.total_servers, 2);
    assert_eq!(stats.healthy_servers, 1);
    assert!((stats.average_replication_factor - 1.5).abs() < 1e-9);
}
