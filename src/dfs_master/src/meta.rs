use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::RwLock;

use dfs_lib::{
    now_ms, ChunkMeta, DfsError, DfsResult, FileMeta, HeartbeatRequest, ReplicationTask,
    ServerMeta, StatsResponse,
};

/// On-disk form of the master's metadata, written as a single JSON document.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedMetadata {
    pub files: Vec<FileMeta>,
    pub chunks: Vec<ChunkMeta>,
    pub servers: Vec<ServerMeta>,
}

#[derive(Default)]
struct MetaState {
    /// filename -> file
    files: HashMap<String, FileMeta>,
    /// file_id -> filename
    file_ids: HashMap<String, String>,
    chunks: HashMap<String, ChunkMeta>,
    servers: HashMap<String, ServerMeta>,
    /// Placement index, kept in lockstep with `ChunkMeta::server_locations`.
    chunk_to_servers: HashMap<String, HashSet<String>>,
    server_to_chunks: HashMap<String, HashSet<String>>,
    /// Outgoing work, drained into heartbeat responses.
    pending_tasks: HashMap<String, Vec<ReplicationTask>>,
    pending_deletes: HashMap<String, Vec<String>>,
}

impl MetaState {
    fn attach_location(&mut self, chunk_id: &str, server_id: &str) {
        self.chunk_to_servers
            .entry(chunk_id.to_string())
            .or_default()
            .insert(server_id.to_string());
        self.server_to_chunks
            .entry(server_id.to_string())
            .or_default()
            .insert(chunk_id.to_string());
        if let Some(chunk) = self.chunks.get_mut(chunk_id) {
            if !chunk.server_locations.iter().any(|s| s == server_id) {
                chunk.server_locations.push(server_id.to_string());
            }
        }
    }

    fn detach_location(&mut self, chunk_id: &str, server_id: &str) {
        if let Some(servers) = self.chunk_to_servers.get_mut(chunk_id) {
            servers.remove(server_id);
        }
        if let Some(chunks) = self.server_to_chunks.get_mut(server_id) {
            chunks.remove(chunk_id);
        }
        if let Some(chunk) = self.chunks.get_mut(chunk_id) {
            chunk.server_locations.retain(|s| s != server_id);
        }
    }

    fn detach_all_locations(&mut self, chunk_id: &str) -> Vec<String> {
        let holders: Vec<String> = self
            .chunk_to_servers
            .remove(chunk_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for server_id in &holders {
            if let Some(chunks) = self.server_to_chunks.get_mut(server_id) {
                chunks.remove(chunk_id);
            }
        }
        if let Some(chunk) = self.chunks.get_mut(chunk_id) {
            chunk.server_locations.clear();
        }
        holders
    }

    /// Drop a chunk entirely and schedule its physical deletion on every
    /// server that may hold it (placement or reported inventory).
    fn remove_chunk_and_schedule_deletes(&mut self, chunk_id: &str) {
        let mut holders: HashSet<String> = self.detach_all_locations(chunk_id).into_iter().collect();
        for (server_id, server) in &self.servers {
            if server.stored_chunks.contains(chunk_id) {
                holders.insert(server_id.clone());
            }
        }
        for server_id in holders {
            self.pending_deletes
                .entry(server_id)
                .or_default()
                .push(chunk_id.to_string());
        }
        self.chunks.remove(chunk_id);
    }
}

/// The master's single source of truth. One reader/writer lock guards the
/// whole store; nothing async happens under the lock.
pub struct MetadataManager {
    state: RwLock<MetaState>,
    data_path: PathBuf,
}

impl MetadataManager {
    /// Open the manager, replaying the metadata file if one exists. A missing
    /// file means a fresh cluster.
    pub fn open(data_path: impl Into<PathBuf>) -> DfsResult<Self> {
        let data_path = data_path.into();
        let manager = Self {
            state: RwLock::new(MetaState::default()),
            data_path,
        };
        match std::fs::read_to_string(&manager.data_path) {
            Ok(raw) => {
                manager.restore(&raw)?;
                info!(
                    "metadata loaded from {}",
                    manager.data_path.to_string_lossy()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no metadata file, starting a fresh cluster");
            }
            Err(e) => {
                return Err(DfsError::Fatal(format!(
                    "read {}: {}",
                    manager.data_path.to_string_lossy(),
                    e
                )))
            }
        }
        Ok(manager)
    }

    // ---- files ----

    pub fn create_file(&self, meta: FileMeta) -> DfsResult<()> {
        let mut state = self.state.write().unwrap();
        if state.files.contains_key(&meta.filename) {
            return Err(DfsError::AlreadyExists(format!(
                "file already exists: {}",
                meta.filename
            )));
        }
        state
            .file_ids
            .insert(meta.file_id.clone(), meta.filename.clone());
        info!("created file {} ({})", meta.filename, meta.file_id);
        state.files.insert(meta.filename.clone(), meta);
        Ok(())
    }

    /// Delete a file and cascade: every chunk is dropped from the metadata
    /// and scheduled for physical deletion on its servers.
    pub fn delete_file(&self, filename: &str) -> DfsResult<FileMeta> {
        let mut state = self.state.write().unwrap();
        let meta = state
            .files
            .remove(filename)
            .ok_or_else(|| DfsError::NotFound(format!("file not found: {}", filename)))?;
        state.file_ids.remove(&meta.file_id);
        for chunk_id in meta.chunk_ids.clone() {
            state.remove_chunk_and_schedule_deletes(&chunk_id);
        }
        info!("deleted file {} ({} chunks)", filename, meta.chunk_ids.len());
        Ok(meta)
    }

    pub fn get_file(&self, filename: &str) -> Option<FileMeta> {
        let state = self.state.read().unwrap();
        state.files.get(filename).cloned()
    }

    pub fn file_by_id(&self, file_id: &str) -> Option<FileMeta> {
        let state = self.state.read().unwrap();
        let filename = state.file_ids.get(file_id)?;
        state.files.get(filename).cloned()
    }

    pub fn list_files(&self, prefix: &str) -> Vec<FileMeta> {
        let state = self.state.read().unwrap();
        let mut files: Vec<FileMeta> = state
            .files
            .values()
            .filter(|f| prefix.is_empty() || f.filename.starts_with(prefix))
            .cloned()
            .collect();
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        files
    }

    pub fn append_file_chunks(&self, file_id: &str, chunk_ids: &[String]) -> DfsResult<()> {
        let mut state = self.state.write().unwrap();
        let filename = state
            .file_ids
            .get(file_id)
            .cloned()
            .ok_or_else(|| DfsError::NotFound(format!("file id not found: {}", file_id)))?;
        let file = state
            .files
            .get_mut(&filename)
            .ok_or_else(|| DfsError::Fatal(format!("file index out of sync for {}", file_id)))?;
        file.chunk_ids.extend_from_slice(chunk_ids);
        Ok(())
    }

    /// Seal a file: all allocated chunks must be among the uploaded set.
    pub fn mark_upload_complete(&self, file_id: &str, uploaded: &[String]) -> DfsResult<FileMeta> {
        let mut state = self.state.write().unwrap();
        let filename = state
            .file_ids
            .get(file_id)
            .cloned()
            .ok_or_else(|| DfsError::NotFound(format!("file id not found: {}", file_id)))?;
        let file = state
            .files
            .get_mut(&filename)
            .ok_or_else(|| DfsError::Fatal(format!("file index out of sync for {}", file_id)))?;

        let uploaded: HashSet<&String> = uploaded.iter().collect();
        if let Some(missing) = file.chunk_ids.iter().find(|id| !uploaded.contains(id)) {
            return Err(DfsError::InvalidArgument(format!(
                "upload incomplete: chunk {} was not written",
                missing
            )));
        }
        file.modified_time = now_ms();
        file.completed = true;
        Ok(file.clone())
    }

    // ---- chunks ----

    pub fn add_chunk(&self, meta: ChunkMeta) -> DfsResult<()> {
        let mut state = self.state.write().unwrap();
        let locations = meta.server_locations.clone();
        let chunk_id = meta.chunk_id.clone();
        state.chunks.insert(chunk_id.clone(), meta);
        for server_id in locations {
            state.attach_location(&chunk_id, &server_id);
        }
        Ok(())
    }

    pub fn get_chunk(&self, chunk_id: &str) -> Option<ChunkMeta> {
        let state = self.state.read().unwrap();
        state.chunks.get(chunk_id).cloned()
    }

    pub fn remove_chunk(&self, chunk_id: &str) -> DfsResult<()> {
        let mut state = self.state.write().unwrap();
        if !state.chunks.contains_key(chunk_id) {
            return Err(DfsError::NotFound(format!("chunk not found: {}", chunk_id)));
        }
        state.remove_chunk_and_schedule_deletes(chunk_id);
        Ok(())
    }

    pub fn add_chunk_location(&self, chunk_id: &str, server_id: &str) {
        let mut state = self.state.write().unwrap();
        state.attach_location(chunk_id, server_id);
    }

    pub fn remove_chunk_location(&self, chunk_id: &str, server_id: &str) {
        let mut state = self.state.write().unwrap();
        state.detach_location(chunk_id, server_id);
    }

    /// Placement index for one server.
    pub fn chunks_on_server(&self, server_id: &str) -> Vec<String> {
        let state = self.state.read().unwrap();
        state
            .server_to_chunks
            .get(server_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Servers whose reported inventory actually contains the chunk.
    pub fn confirmed_holders(&self, chunk_id: &str) -> Vec<String> {
        let state = self.state.read().unwrap();
        state
            .servers
            .values()
            .filter(|s| s.stored_chunks.contains(chunk_id))
            .map(|s| s.server_id.clone())
            .collect()
    }

    /// All sibling blocks of an erasure group, excluding `chunk_id` itself.
    pub fn group_siblings(&self, group_id: &str, chunk_id: &str) -> Vec<ChunkMeta> {
        let state = self.state.read().unwrap();
        state
            .chunks
            .values()
            .filter(|c| c.erasure_group_id == group_id && c.chunk_id != chunk_id)
            .cloned()
            .collect()
    }

    // ---- servers ----

    pub fn register_server(&self, meta: ServerMeta) -> DfsResult<()> {
        let mut state = self.state.write().unwrap();
        info!(
            "registered chunk server {} at {}",
            meta.server_id,
            meta.endpoint()
        );
        state
            .server_to_chunks
            .entry(meta.server_id.clone())
            .or_default();
        state.servers.insert(meta.server_id.clone(), meta);
        Ok(())
    }

    pub fn unregister_server(&self, server_id: &str) -> DfsResult<()> {
        let mut state = self.state.write().unwrap();
        if state.servers.remove(server_id).is_none() {
            return Err(DfsError::NotFound(format!(
                "server not found: {}",
                server_id
            )));
        }
        let chunk_ids: Vec<String> = state
            .server_to_chunks
            .remove(server_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for chunk_id in chunk_ids {
            if let Some(servers) = state.chunk_to_servers.get_mut(&chunk_id) {
                servers.remove(server_id);
            }
            if let Some(chunk) = state.chunks.get_mut(&chunk_id) {
                chunk.server_locations.retain(|s| s != server_id);
            }
        }
        state.pending_tasks.remove(server_id);
        state.pending_deletes.remove(server_id);
        info!("unregistered chunk server {}", server_id);
        Ok(())
    }

    pub fn get_server(&self, server_id: &str) -> Option<ServerMeta> {
        let state = self.state.read().unwrap();
        state.servers.get(server_id).cloned()
    }

    pub fn all_servers(&self) -> Vec<ServerMeta> {
        let state = self.state.read().unwrap();
        state.servers.values().cloned().collect()
    }

    pub fn healthy_servers(&self) -> Vec<ServerMeta> {
        let state = self.state.read().unwrap();
        state
            .servers
            .values()
            .filter(|s| s.is_healthy)
            .cloned()
            .collect()
    }

    pub fn mark_server_unhealthy(&self, server_id: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(server) = state.servers.get_mut(server_id) {
            server.is_healthy = false;
            warn!("marked server {} unhealthy", server_id);
        }
    }

    pub fn server_address(&self, server_id: &str) -> Option<String> {
        let state = self.state.read().unwrap();
        state.servers.get(server_id).map(|s| s.endpoint())
    }

    /// Process a heartbeat: refresh the server record, reconcile its reported
    /// inventory, and hand back the pending work queued for it.
    ///
    /// Reconciliation rules: a reported chunk the master knows but has not
    /// recorded on this server is a completed copy (repair or rebalance) and
    /// becomes a location; a reported chunk the master does not know at all
    /// is an orphan and is scheduled for deletion. Placements *absent* from
    /// the inventory are left alone — they may be writes still in flight.
    pub fn heartbeat(
        &self,
        req: &HeartbeatRequest,
    ) -> DfsResult<(Vec<ReplicationTask>, Vec<String>)> {
        let mut state = self.state.write().unwrap();
        if !state.servers.contains_key(&req.server_id) {
            return Err(DfsError::NotFound(format!(
                "server not registered: {}",
                req.server_id
            )));
        }

        let inventory: HashSet<String> = req.stored_chunks.iter().cloned().collect();
        let mut orphans: Vec<String> = Vec::new();
        for chunk_id in &inventory {
            if state.chunks.contains_key(chunk_id) {
                let recorded = state
                    .chunk_to_servers
                    .get(chunk_id)
                    .map(|s| s.contains(&req.server_id))
                    .unwrap_or(false);
                if !recorded {
                    debug!(
                        "heartbeat: {} now holds {}, recording location",
                        req.server_id, chunk_id
                    );
                    state.attach_location(chunk_id, &req.server_id);
                }
            } else {
                orphans.push(chunk_id.clone());
            }
        }

        let server = state
            .servers
            .get_mut(&req.server_id)
            .ok_or_else(|| DfsError::Fatal("server map out of sync".to_string()))?;
        server.free_space = req.free_space;
        server.chunk_count = req.chunk_count;
        server.cpu_usage = req.cpu_usage;
        server.memory_usage = req.memory_usage;
        server.stored_chunks = inventory;
        server.last_heartbeat = now_ms();
        server.is_healthy = true;

        let tasks = state.pending_tasks.remove(&req.server_id).unwrap_or_default();
        let mut deletes = state
            .pending_deletes
            .remove(&req.server_id)
            .unwrap_or_default();
        if !orphans.is_empty() {
            debug!(
                "heartbeat: {} holds {} orphaned chunks, scheduling deletion",
                req.server_id,
                orphans.len()
            );
            deletes.extend(orphans);
        }
        Ok((tasks, deletes))
    }

    // ---- outgoing work queues ----

    /// Queue a replication task for both its source and its target server.
    /// Duplicate `(chunk, target)` pairs already in a queue are skipped, so
    /// the repair sweep can re-emit tasks until the copy is confirmed.
    pub fn queue_replication(&self, task: ReplicationTask) {
        let mut state = self.state.write().unwrap();
        for server_id in [task.source_server.clone(), task.target_server.clone()] {
            if server_id.is_empty() {
                continue;
            }
            let queue = state.pending_tasks.entry(server_id).or_default();
            let duplicate = queue
                .iter()
                .any(|t| t.chunk_id == task.chunk_id && t.target_server == task.target_server);
            if !duplicate {
                queue.push(task.clone());
            }
        }
    }

    pub fn queue_delete(&self, server_id: &str, chunk_id: &str) {
        let mut state = self.state.write().unwrap();
        let queue = state.pending_deletes.entry(server_id.to_string()).or_default();
        if !queue.iter().any(|c| c == chunk_id) {
            queue.push(chunk_id.to_string());
        }
    }

    pub fn pending_task_count(&self) -> usize {
        let state = self.state.read().unwrap();
        state.pending_tasks.values().map(Vec::len).sum()
    }

    // ---- maintenance ----

    /// Servers overdue for a heartbeat but still marked healthy.
    pub fn overdue_servers(&self, timeout_ms: u64) -> Vec<String> {
        let now = now_ms();
        let state = self.state.read().unwrap();
        state
            .servers
            .values()
            .filter(|s| s.is_healthy && now.saturating_sub(s.last_heartbeat) > timeout_ms)
            .map(|s| s.server_id.clone())
            .collect()
    }

    /// Unregister servers that have been unhealthy for `2 × timeout`.
    pub fn cleanup_dead_servers(&self, timeout_ms: u64) -> Vec<String> {
        let now = now_ms();
        let dead: Vec<String> = {
            let state = self.state.read().unwrap();
            state
                .servers
                .values()
                .filter(|s| {
                    !s.is_healthy && now.saturating_sub(s.last_heartbeat) > 2 * timeout_ms
                })
                .map(|s| s.server_id.clone())
                .collect()
        };
        for server_id in &dead {
            if let Err(e) = self.unregister_server(server_id) {
                warn!("cleanup of dead server {} failed: {}", server_id, e);
            }
        }
        dead
    }

    /// Drop chunks no file references any more.
    pub fn cleanup_orphaned_chunks(&self) -> usize {
        let mut state = self.state.write().unwrap();
        let referenced: HashSet<String> = state
            .files
            .values()
            .flat_map(|f| f.chunk_ids.iter().cloned())
            .collect();
        let orphaned: Vec<String> = state
            .chunks
            .keys()
            .filter(|id| !referenced.contains(*id))
            .cloned()
            .collect();
        for chunk_id in &orphaned {
            info!("cleaning up orphaned chunk {}", chunk_id);
            state.remove_chunk_and_schedule_deletes(chunk_id);
        }
        orphaned.len()
    }

    /// Delete files whose upload never completed within the deadline.
    pub fn sweep_stale_uploads(&self, deadline_ms: u64) -> Vec<String> {
        let now = now_ms();
        let stale: Vec<String> = {
            let state = self.state.read().unwrap();
            state
                .files
                .values()
                .filter(|f| !f.completed && now.saturating_sub(f.created_time) > deadline_ms)
                .map(|f| f.filename.clone())
                .collect()
        };
        for filename in &stale {
            warn!("sweeping stale upload {}", filename);
            let _ = self.delete_file(filename);
        }
        stale
    }

    pub fn statistics(&self) -> StatsResponse {
        let state = self.state.read().unwrap();
        let mut stats = StatsResponse {
            total_files: state.files.len() as u64,
            total_chunks: state.chunks.len() as u64,
            total_servers: state.servers.len() as u64,
            ..Default::default()
        };
        for server in state.servers.values() {
            if server.is_healthy {
                stats.healthy_servers += 1;
            }
            stats.total_storage_used += server.total_space.saturating_sub(server.free_space);
            stats.total_storage_available += server.free_space;
        }
        let total_replicas: usize = state
            .chunks
            .values()
            .map(|c| c.server_locations.len())
            .sum();
        if !state.chunks.is_empty() {
            stats.average_replication_factor = total_replicas as f64 / state.chunks.len() as f64;
        }
        stats
    }

    // ---- persistence ----

    /// Serialize the full state under the read lock; callers write the file
    /// outside of it.
    pub fn snapshot_json(&self) -> DfsResult<String> {
        let state = self.state.read().unwrap();
        let persisted = PersistedMetadata {
            files: state.files.values().cloned().collect(),
            chunks: state.chunks.values().cloned().collect(),
            servers: state.servers.values().cloned().collect(),
        };
        serde_json::to_string_pretty(&persisted)
            .map_err(|e| DfsError::Fatal(format!("serialize metadata: {}", e)))
    }

    pub fn data_path(&self) -> &PathBuf {
        &self.data_path
    }

    /// Write the metadata file. A failure here is fatal for the master.
    pub fn save(&self) -> DfsResult<()> {
        let json = self.snapshot_json()?;
        let tmp = self.data_path.with_extension("tmp");
        std::fs::write(&tmp, &json)
            .and_then(|_| std::fs::rename(&tmp, &self.data_path))
            .map_err(|e| {
                DfsError::Fatal(format!(
                    "persist metadata to {}: {}",
                    self.data_path.to_string_lossy(),
                    e
                ))
            })?;
        debug!("metadata persisted ({} bytes)", json.len());
        Ok(())
    }

    fn restore(&self, raw: &str) -> DfsResult<()> {
        let persisted: PersistedMetadata = serde_json::from_str(raw)
            .map_err(|e| DfsError::Fatal(format!("parse metadata file: {}", e)))?;

        let mut state = self.state.write().unwrap();
        *state = MetaState::default();
        for file in persisted.files {
            state.file_ids.insert(file.file_id.clone(), file.filename.clone());
            state.files.insert(file.filename.clone(), file);
        }
        for chunk in persisted.chunks {
            let chunk_id = chunk.chunk_id.clone();
            let locations = chunk.server_locations.clone();
            state.chunks.insert(chunk_id.clone(), chunk);
            for server_id in locations {
                state
                    .chunk_to_servers
                    .entry(chunk_id.clone())
                    .or_default()
                    .insert(server_id.clone());
                state
                    .server_to_chunks
                    .entry(server_id)
                    .or_default()
                    .insert(chunk_id.clone());
            }
        }
        for server in persisted.servers {
            state
                .server_to_chunks
                .entry(server.server_id.clone())
                .or_default();
            state.servers.insert(server.server_id.clone(), server);
        }
        Ok(())
    }
}
