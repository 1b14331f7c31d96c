use crate::{ChunkAllocator, MetadataManager};
use dfs_lib::{now_ms, AllocationStrategy, Config, DfsError, ServerMeta};
use std::collections::HashSet;
use std::sync::Arc;

fn small_config() -> Config {
    Config {
        chunk_size: 1024,
        replication_factor: 3,
        ec_data_blocks: 4,
        ec_parity_blocks: 2,
        ..Config::default()
    }
}

fn setup(config: &Config) -> (Arc<MetadataManager>, ChunkAllocator, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let meta = Arc::new(MetadataManager::open(dir.path().join("meta.json")).unwrap());
    let allocator = ChunkAllocator::new(meta.clone(), config);
    (meta, allocator, dir)
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

fn add_servers(meta: &MetadataManager, count: usize) {
    for i in 0..count {
        meta.register_server(server(&format!("s{}", i), 7000 + i as u16))
            .unwrap();
    }
}

#[test]
fn replicated_allocation_shapes_and_sizes() {
    let config = small_config();
    let (meta, allocator, _dir) = setup(&config);
    add_servers(&meta, 4);

    // 2.5 chunks worth of data: 3 chunks, the last one short.
    let chunks = allocator.allocate_chunks("file_1", 2560, false).unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].chunk_id, "file_1_chunk_0");
    assert_eq!(chunks[0].size, 1024);
    assert_eq!(chunks[2].size, 512);
    assert!(chunks.iter().all(|c| !c.is_erasure_coded));
    assert!(chunks.iter().all(|c| c.server_addresses.len() == 3));

    // Placement is recorded before the call returns.
    let recorded = meta.get_chunk("file_1_chunk_1").unwrap();
    assert_eq!(recorded.server_locations.len(), 3);
}

#[test]
fn replica_diversity_no_server_repeats() {
    let config = small_config();
    let (meta, allocator, _dir) = setup(&config);
    add_servers(&meta, 5);

    let chunks = allocator.allocate_chunks("file_1", 4096, false).unwrap();
    for chunk in chunks {
        let meta_chunk = meta.get_chunk(&chunk.chunk_id).unwrap();
        let distinct: HashSet<&String> = meta_chunk.server_locations.iter().collect();
        assert_eq!(distinct.len(), meta_chunk.server_locations.len());
    }
}

#[test]
fn erasure_allocation_spreads_blocks_across_distinct_servers() {
    let config = small_config();
    let (meta, allocator, _dir) = setup(&config);
    add_servers(&meta, 6);

    let chunks = allocator.allocate_chunks("file_1", 2048, true).unwrap();
    // Two slices, six blocks each.
    assert_eq!(chunks.len(), 12);
    assert_eq!(chunks[0].chunk_id, "file_1_group_0_block_0");
    assert_eq!(chunks[11].chunk_id, "file_1_group_1_block_5");

    for group in 0..2 {
        let servers: HashSet<String> = (0..6)
            .map(|b| {
                let id = format!("file_1_group_{}_block_{}", group, b);
                let meta_chunk = meta.get_chunk(&id).unwrap();
                assert!(meta_chunk.is_erasure_coded);
                assert_eq!(meta_chunk.erasure_block_index, b as u32);
                assert_eq!(meta_chunk.is_parity_block, b >= 4);
                assert_eq!(meta_chunk.server_locations.len(), 1);
                meta_chunk.server_locations[0].clone()
            })
            .collect();
        assert_eq!(servers.len(), 6, "blocks of a group must not share servers");
    }
}

#[test]
fn allocation_fails_with_no_servers() {
    let config = small_config();
    let (_meta, allocator, _dir) = setup(&config);
    let err = allocator.allocate_chunks("file_1", 100, false).unwrap_err();
    assert!(matches!(err, DfsError::Unavailable(_)));
}

#[test]
fn space_guard_excludes_nearly_full_servers() {
    let config = small_config();
    let (meta, allocator, _dir) = setup(&config);

    // 9% free: projected free space would dip below the 10% floor.
    let mut full = server("full", 7000);
    full.free_space = full.total_space / 100 * 9;
    meta.register_server(full).unwrap();
    let mut roomy = server("roomy", 7001);
    roomy.free_space = roomy.total_space / 2;
    meta.register_server(roomy).unwrap();

    let chunks = allocator.allocate_chunks("file_1", 100, false).unwrap();
    let placed = meta.get_chunk(&chunks[0].chunk_id).unwrap();
    assert_eq!(placed.server_locations, vec!["roomy".to_string()]);
}

#[test]
fn least_loaded_prefers_idle_servers() {
    let mut config = small_config();
    config.replication_factor = 1;
    config.allocation_strategy = AllocationStrategy::LeastLoaded;
    let (meta, allocator, _dir) = setup(&config);

    let mut busy = server("busy", 7000);
    busy.cpu_usage = 0.9;
    busy.memory_usage = 0.9;
    busy.free_space = busy.total_space / 4;
    meta.register_server(busy).unwrap();
    let idle = server("idle", 7001);
    meta.register_server(idle).unwrap();

    let chunks = allocator.allocate_chunks("file_1", 100, false).unwrap();
    let placed = meta.get_chunk(&chunks[0].chunk_id).unwrap();
    assert_eq!(placed.server_locations, vec!["idle".to_string()]);
}

#[test]
fn round_robin_cycles_through_servers() {
    let mut config = small_config();
    config.replication_factor = 1;
    config.allocation_strategy = AllocationStrategy::RoundRobin;
    let (meta, allocator, _dir) = setup(&config);
    add_servers(&meta, 3);

    let chunks = allocator.allocate_chunks("file_1", 3 * 1024, false).unwrap();
    let placements: HashSet<String> = chunks
        .iter()
        .map(|c| meta.get_chunk(&c.chunk_id).unwrap().server_locations[0].clone())
        .collect();
    assert_eq!(placements.len(), 3);
}

#[test]
fn zone_aware_spreads_across_zones_first() {
    let mut config = small_config();
    config.allocation_strategy = AllocationStrategy::ZoneAware;
    let (meta, allocator, _dir) = setup(&config);

    for (i, zone) in ["east", "east", "west", "north"].iter().enumerate() {
        let mut s = server(&format!("s{}", i), 7000 + i as u16);
        s.zone = zone.to_string();
        meta.register_server(s).unwrap();
    }

    let chunks = allocator.allocate_chunks("file_1", 100, false).unwrap();
    let placed = meta.get_chunk(&chunks[0].chunk_id).unwrap();
    let zones: HashSet<String> = placed
        .server_locations
        .iter()
        .map(|id| meta.get_server(id).unwrap().zone)
        .collect();
    assert_eq!(zones.len(), 3, "three replicas should span three zones");
}

#[test]
fn server_failure_queues_repair_to_surviving_source() {
    let config = small_config();
    let (meta, allocator, _dir) = setup(&config);
    add_servers(&meta, 4);

    meta.create_file(dfs_lib::FileMeta {
        file_id: "file_1".to_string(),
        filename: "/a".to_string(),
        size: 1024,
        created_time: now_ms(),
        modified_time: now_ms(),
        is_encrypted: false,
        encryption_key_id: String::new(),
        is_erasure_coded: false,
        chunk_ids: Vec::new(),
        completed: false,
    })
    .unwrap();
    let chunks = allocator.allocate_chunks("file_1", 1024, false).unwrap();
    let chunk_id = chunks[0].chunk_id.clone();
    meta.append_file_chunks("file_1", &[chunk_id.clone()]).unwrap();
    meta.mark_upload_complete("file_1", &[chunk_id.clone()]).unwrap();

    let victim = meta.get_chunk(&chunk_id).unwrap().server_locations[0].clone();
    // Survivors actually hold the chunk.
    for holder in meta.get_chunk(&chunk_id).unwrap().server_locations.iter() {
        if holder != &victim {
            let mut s = meta.get_server(holder).unwrap();
            s.stored_chunks.insert(chunk_id.clone());
            meta.register_server(s).unwrap();
        }
    }

    allocator.handle_server_failure(&victim);

    assert!(!meta.get_server(&victim).unwrap().is_healthy);
    let survivors = meta.get_chunk(&chunk_id).unwrap().server_locations;
    assert_eq!(survivors.len(), 2);
    assert!(!survivors.contains(&victim));
    // A repair task was queued for source and target.
    assert_eq!(meta.pending_task_count(), 2);
}

#[test]
fn corruption_report_schedules_delete_and_repair() {
    let config = small_config();
    let (meta, allocator, _dir) = setup(&config);
    add_servers(&meta, 4);

    let chunks = allocator.allocate_chunks("file_1", 100, false).unwrap();
    let chunk_id = chunks[0].chunk_id.clone();
    let bad = meta.get_chunk(&chunk_id).unwrap().server_locations[0].clone();

    allocator.handle_corruption(&chunk_id, &bad);

    let locations = meta.get_chunk(&chunk_id).unwrap().server_locations;
    assert!(!locations.contains(&bad));
    assert!(meta.pending_task_count() > 0);
}

#[test]
fn rebalance_triggers_on_skewed_load() {
    let mut config = small_config();
    config.replication_factor = 1;
    let (meta, allocator, _dir) = setup(&config);

    // Three stuffed servers and one empty one.
    for i in 0..3 {
        let mut s = server(&format!("full{}", i), 7000 + i);
        s.free_space = s.total_space / 5; // 80% full
        s.stored_chunks.insert(format!("c{}", i));
        meta.register_server(s).unwrap();
        meta.add_chunk(dfs_lib::ChunkMeta {
            chunk_id: format!("c{}", i),
            size: 100,
            checksum: String::new(),
            is_erasure_coded: false,
            erasure_group_id: String::new(),
            erasure_block_index: 0,
            is_parity_block: false,
            server_locations: vec![format!("full{}", i)],
            created_time: now_ms(),
            last_accessed_time: now_ms() - 1000,
        })
        .unwrap();
    }
    meta.register_server(server("empty", 7010)).unwrap();

    assert!(allocator.cluster_load_stddev() > 0.15);
    assert!(allocator.should_rebalance() || allocator.cluster_load_stddev() <= 0.30);

    // Force the overload path: crank CPU on one server.
    let mut hot = meta.get_server("full0").unwrap();
    hot.cpu_usage = 1.0;
    hot.memory_usage = 1.0;
    meta.register_server(hot).unwrap();
    assert!(allocator.should_rebalance());

    let queued = allocator.generate_rebalance_tasks();
    assert_eq!(queued, 1);
    let (tasks, _) = meta
        .heartbeat(&dfs_lib::HeartbeatRequest {
            server_id: "empty".to_string(),
            free_space: 1 << 30,
            chunk_count: 0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            stored_chunks: vec![],
        })
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].source_server, "full0");
    assert_eq!(tasks[0].target_server, "empty");
    assert!(!tasks[0].is_urgent);
}

#[test]
fn trim_removes_surplus_confirmed_copy() {
    let mut config = small_config();
    config.replication_factor = 1;
    let (meta, allocator, _dir) = setup(&config);

    let mut loaded = server("loaded", 7000);
    loaded.free_space = loaded.total_space / 5;
    loaded.stored_chunks.insert("file_1_chunk_0".to_string());
    meta.register_server(loaded).unwrap();
    let mut light = server("light", 7001);
    light.stored_chunks.insert("file_1_chunk_0".to_string());
    meta.register_server(light).unwrap();

    meta.create_file(dfs_lib::FileMeta {
        file_id: "file_1".to_string(),
        filename: "/a".to_string(),
        size: 100,
        created_time: now_ms(),
        modified_time: now_ms(),
        is_encrypted: false,
        encryption_key_id: String::new(),
        is_erasure_coded: false,
        chunk_ids: vec!["file_1_chunk_0".to_string()],
        completed: true,
    })
    .unwrap();
    meta.add_chunk(dfs_lib::ChunkMeta {
        chunk_id: "file_1_chunk_0".to_string(),
        size: 100,
        checksum: String::new(),
        is_erasure_coded: false,
        erasure_group_id: String::new(),
        erasure_block_index: 0,
        is_parity_block: false,
        server_locations: vec!["loaded".to_string(), "light".to_string()],
        created_time: now_ms(),
        last_accessed_time: now_ms(),
    })
    .unwrap();

    let trimmed = allocator.trim_over_replicated();
    assert_eq!(trimmed, 1);
    // The heavier holder gives up its copy.
    assert_eq!(
        meta.get_chunk("file_1_chunk_0").unwrap().server_locations,
        vec!["light".to_string()]
    );
}

#[test]
fn ec_block_with_no_copy_gets_reconstruction_task() {
    let config = small_config();
    let (meta, allocator, _dir) = setup(&config);
    add_servers(&meta, 7);

    meta.create_file(dfs_lib::FileMeta {
        file_id: "file_1".to_string(),
        filename: "/ec".to_string(),
        size: 1024,
        created_time: now_ms(),
        modified_time: now_ms(),
        is_encrypted: false,
        encryption_key_id: String::new(),
        is_erasure_coded: true,
        chunk_ids: Vec::new(),
        completed: false,
    })
    .unwrap();
    let chunks = allocator.allocate_chunks("file_1", 1024, true).unwrap();
    let ids: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
    meta.append_file_chunks("file_1", &ids).unwrap();
    meta.mark_upload_complete("file_1", &ids).unwrap();

    // Lose block 2's only holder.
    let lost = "file_1_group_0_block_2";
    let holder = meta.get_chunk(lost).unwrap().server_locations[0].clone();
    meta.remove_chunk_location(lost, &holder);

    let queued = allocator.repair_chunk(lost);
    assert_eq!(queued, 1);

    // The queued task carries a reconstruction recipe with >= k siblings.
    let target_ids: Vec<String> = meta
        .all_servers()
        .iter()
        .map(|s| s.server_id.clone())
        .collect();
    let mut found = false;
    for server_id in target_ids {
        let (tasks, _) = meta
            .heartbeat(&dfs_lib::HeartbeatRequest {
                server_id: server_id.clone(),
                free_space: 1 << 30,
                chunk_count: 0,
                cpu_usage: 0.0,
                memory_usage: 0.0,
                stored_chunks: vec![],
            })
            .unwrap();
        for task in tasks {
            if task.chunk_id == lost {
                let repair = task.ec_repair.expect("reconstruction recipe expected");
                assert_eq!(repair.block_index, 2);
                assert_eq!(repair.data_blocks, 4);
                assert!(repair.siblings.len() >= 4);
                found = true;
            }
        }
    }
    assert!(found);
}
