use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dfs_lib::{
    block_id_for, chunk_id_for, group_id_for, now_ms, AllocationStrategy, ChunkInfo, ChunkMeta,
    Config, DfsError, DfsResult, EcRepairTask, ReplicationTask, ServerMeta, SiblingBlock,
    MIN_FREE_SPACE_FRACTION,
};

use crate::{MetadataManager, LOAD_STDDEV_THRESHOLD, OVERLOAD_THRESHOLD, UNDERLOAD_THRESHOLD};

/// Places chunks on servers, repairs lost redundancy, and drives rebalance.
pub struct ChunkAllocator {
    meta: Arc<MetadataManager>,
    strategy: AllocationStrategy,
    replication_factor: usize,
    chunk_size: u64,
    ec_data_blocks: usize,
    ec_parity_blocks: usize,
    round_robin_index: AtomicUsize,
}

impl ChunkAllocator {
    pub fn new(meta: Arc<MetadataManager>, config: &Config) -> Self {
        info!(
            "chunk allocator using {:?} strategy, R={}, k={}, m={}",
            config.allocation_strategy,
            config.replication_factor,
            config.ec_data_blocks,
            config.ec_parity_blocks
        );
        Self {
            meta,
            strategy: config.allocation_strategy,
            replication_factor: config.replication_factor,
            chunk_size: config.chunk_size,
            ec_data_blocks: config.ec_data_blocks,
            ec_parity_blocks: config.ec_parity_blocks,
            round_robin_index: AtomicUsize::new(0),
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn ec_params(&self) -> (usize, usize) {
        (self.ec_data_blocks, self.ec_parity_blocks)
    }

    /// Allocate placements for a whole file and record them in the metadata.
    /// Replicated files get `⌈size / chunk_size⌉` chunks on `R` distinct
    /// servers each; erasure-coded files get one `(k+m)`-block group per
    /// chunk-sized slice, each block on its own server.
    pub fn allocate_chunks(
        &self,
        file_id: &str,
        file_size: u64,
        erasure_coded: bool,
    ) -> DfsResult<Vec<ChunkInfo>> {
        if self.meta.healthy_servers().is_empty() {
            return Err(DfsError::Unavailable(
                "no healthy chunk servers registered".to_string(),
            ));
        }

        let allocated = if erasure_coded {
            self.allocate_erasure_coded(file_id, file_size)?
        } else {
            self.allocate_replicated(file_id, file_size)?
        };
        info!(
            "allocated {} chunks for {} ({})",
            allocated.len(),
            file_id,
            if erasure_coded { "erasure coded" } else { "replicated" }
        );
        Ok(allocated)
    }

    fn allocate_replicated(&self, file_id: &str, file_size: u64) -> DfsResult<Vec<ChunkInfo>> {
        let chunk_count = file_size.div_ceil(self.chunk_size) as usize;
        let mut allocated = Vec::with_capacity(chunk_count);

        for index in 0..chunk_count {
            let chunk_id = chunk_id_for(file_id, index);
            let servers = self.pick_servers(self.replication_factor, &[])?;
            if servers.len() < self.replication_factor {
                warn!(
                    "chunk {}: only {} of {} replicas placed",
                    chunk_id,
                    servers.len(),
                    self.replication_factor
                );
            }
            let size = (file_size - index as u64 * self.chunk_size).min(self.chunk_size);
            let now = now_ms();
            self.meta.add_chunk(ChunkMeta {
                chunk_id: chunk_id.clone(),
                size,
                checksum: String::new(),
                is_erasure_coded: false,
                erasure_group_id: String::new(),
                erasure_block_index: 0,
                is_parity_block: false,
                server_locations: servers.clone(),
                created_time: now,
                last_accessed_time: now,
            })?;
            allocated.push(ChunkInfo {
                chunk_id,
                server_addresses: self.resolve_addresses(&servers),
                size,
                checksum: String::new(),
                is_erasure_coded: false,
            });
        }
        Ok(allocated)
    }

    fn allocate_erasure_coded(&self, file_id: &str, file_size: u64) -> DfsResult<Vec<ChunkInfo>> {
        let groups = file_size.div_ceil(self.chunk_size) as usize;
        let total_blocks = self.ec_data_blocks + self.ec_parity_blocks;
        let mut allocated = Vec::with_capacity(groups * total_blocks);

        for group in 0..groups {
            let group_id = group_id_for(file_id, group);
            let slice_len =
                (file_size - group as u64 * self.chunk_size).min(self.chunk_size);
            let block_size = slice_len.div_ceil(self.ec_data_blocks as u64);
            let mut used_in_group: Vec<String> = Vec::with_capacity(total_blocks);

            for block in 0..total_blocks {
                let chunk_id = block_id_for(&group_id, block);
                let servers = self.pick_servers(1, &used_in_group)?;
                let server = servers.into_iter().next().ok_or_else(|| {
                    DfsError::Unavailable(format!(
                        "no server available for erasure block {}",
                        chunk_id
                    ))
                })?;
                used_in_group.push(server.clone());

                let now = now_ms();
                self.meta.add_chunk(ChunkMeta {
                    chunk_id: chunk_id.clone(),
                    size: block_size,
                    checksum: String::new(),
                    is_erasure_coded: true,
                    erasure_group_id: group_id.clone(),
                    erasure_block_index: block as u32,
                    is_parity_block: block >= self.ec_data_blocks,
                    server_locations: vec![server.clone()],
                    created_time: now,
                    last_accessed_time: now,
                })?;
                allocated.push(ChunkInfo {
                    chunk_id,
                    server_addresses: self.resolve_addresses(&[server]),
                    size: block_size,
                    checksum: String::new(),
                    is_erasure_coded: true,
                });
            }
        }
        Ok(allocated)
    }

    /// Choose `count` distinct healthy servers, never dipping a server below
    /// the 10% free-space floor, never reusing anything in `exclude`.
    fn pick_servers(&self, count: usize, exclude: &[String]) -> DfsResult<Vec<String>> {
        let excluded: HashSet<&String> = exclude.iter().collect();
        let mut candidates: Vec<ServerMeta> = self
            .meta
            .healthy_servers()
            .into_iter()
            .filter(|s| !excluded.contains(&s.server_id))
            .filter(|s| self.has_enough_space(s))
            .collect();

        if candidates.is_empty() {
            return Err(DfsError::Unavailable(
                "no healthy server with enough free space".to_string(),
            ));
        }

        let picked = match self.strategy {
            AllocationStrategy::RoundRobin => self.pick_round_robin(&mut candidates, count),
            AllocationStrategy::LeastLoaded => Self::pick_least_loaded(&mut candidates, count),
            AllocationStrategy::Random => Self::pick_random(&mut candidates, count),
            AllocationStrategy::ZoneAware => Self::pick_zone_aware(&mut candidates, count),
        };
        Ok(picked)
    }

    fn has_enough_space(&self, server: &ServerMeta) -> bool {
        let floor = (server.total_space as f64 * MIN_FREE_SPACE_FRACTION) as u64;
        server.free_space.saturating_sub(self.chunk_size) >= floor
    }

    fn pick_round_robin(&self, candidates: &mut Vec<ServerMeta>, count: usize) -> Vec<String> {
        candidates.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        let mut picked = Vec::with_capacity(count);
        while picked.len() < count && !candidates.is_empty() {
            let index = self.round_robin_index.fetch_add(1, Ordering::Relaxed);
            let server = candidates.remove(index % candidates.len());
            picked.push(server.server_id);
        }
        picked
    }

    fn pick_least_loaded(candidates: &mut [ServerMeta], count: usize) -> Vec<String> {
        candidates.sort_by(|a, b| {
            a.load()
                .partial_cmp(&b.load())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
            .iter()
            .take(count)
            .map(|s| s.server_id.clone())
            .collect()
    }

    fn pick_random(candidates: &mut [ServerMeta], count: usize) -> Vec<String> {
        candidates.shuffle(&mut rand::thread_rng());
        candidates
            .iter()
            .take(count)
            .map(|s| s.server_id.clone())
            .collect()
    }

    /// One server per zone first, then fill the remainder by load.
    fn pick_zone_aware(candidates: &mut Vec<ServerMeta>, count: usize) -> Vec<String> {
        candidates.sort_by(|a, b| {
            a.load()
                .partial_cmp(&b.load())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut picked: Vec<String> = Vec::with_capacity(count);
        let mut used_zones: HashSet<String> = HashSet::new();
        for server in candidates.iter() {
            if picked.len() >= count {
                break;
            }
            if used_zones.insert(server.zone.clone()) {
                picked.push(server.server_id.clone());
            }
        }
        if picked.len() < count {
            let chosen: HashSet<&String> = picked.iter().collect();
            let fill: Vec<String> = candidates
                .iter()
                .filter(|s| !chosen.contains(&s.server_id))
                .take(count - picked.len())
                .map(|s| s.server_id.clone())
                .collect();
            picked.extend(fill);
        }
        picked
    }

    fn resolve_addresses(&self, server_ids: &[String]) -> Vec<String> {
        server_ids
            .iter()
            .filter_map(|id| self.meta.server_address(id))
            .collect()
    }

    // ---- repair ----

    /// Handle a server dropping out: strip its placements and queue repair
    /// for everything that fell below target redundancy.
    pub fn handle_server_failure(&self, server_id: &str) {
        warn!("handling failure of server {}", server_id);
        self.meta.mark_server_unhealthy(server_id);
        for chunk_id in self.meta.chunks_on_server(server_id) {
            self.meta.remove_chunk_location(&chunk_id, server_id);
            self.repair_chunk_excluding(&chunk_id, &[server_id.to_string()]);
        }
    }

    /// A corruption report is the single-chunk variant of a server failure.
    pub fn handle_corruption(&self, chunk_id: &str, server_id: &str) {
        self.meta.remove_chunk_location(chunk_id, server_id);
        self.meta.queue_delete(server_id, chunk_id);
        self.repair_chunk_excluding(chunk_id, &[server_id.to_string()]);
    }

    pub fn repair_chunk(&self, chunk_id: &str) -> usize {
        self.repair_chunk_excluding(chunk_id, &[])
    }

    /// Queue the replication (or erasure reconstruction) tasks that bring one
    /// chunk back to target redundancy. Queues are deduplicated, so the sweep
    /// may call this repeatedly until the copies are confirmed.
    pub fn repair_chunk_excluding(&self, chunk_id: &str, exclude: &[String]) -> usize {
        let Some(chunk) = self.meta.get_chunk(chunk_id) else {
            return 0;
        };
        let target = if chunk.is_erasure_coded {
            1
        } else {
            self.replication_factor
        };
        if chunk.server_locations.len() >= target {
            return 0;
        }

        let missing = target - chunk.server_locations.len();
        let mut excluded = chunk.server_locations.clone();
        excluded.extend_from_slice(exclude);
        let targets = match self.pick_servers(missing, &excluded) {
            Ok(t) => t,
            Err(e) => {
                warn!("repair of {} cannot place new copies: {}", chunk_id, e);
                return 0;
            }
        };

        // Copy from a live server that actually holds the bytes.
        let confirmed = self.meta.confirmed_holders(chunk_id);
        let source = confirmed
            .iter()
            .chain(chunk.server_locations.iter())
            .find(|s| {
                self.meta
                    .get_server(s)
                    .map(|server| server.is_healthy)
                    .unwrap_or(false)
            })
            .cloned();

        let mut queued = 0;
        for target_server in targets {
            let Some(target_address) = self.meta.server_address(&target_server) else {
                continue;
            };
            let task = if let Some(source_server) = &source {
                let Some(source_address) = self.meta.server_address(source_server) else {
                    continue;
                };
                ReplicationTask {
                    chunk_id: chunk_id.to_string(),
                    source_server: source_server.clone(),
                    source_address,
                    target_server,
                    target_address,
                    is_urgent: true,
                    ec_repair: None,
                }
            } else if chunk.is_erasure_coded {
                match self.build_ec_repair_task(&chunk, &target_server, &target_address) {
                    Some(task) => task,
                    None => {
                        error!(
                            "erasure block {} has no surviving copy and too few siblings",
                            chunk_id
                        );
                        continue;
                    }
                }
            } else {
                error!("chunk {} has no surviving replica, data lost", chunk_id);
                continue;
            };
            self.meta.queue_replication(task);
            queued += 1;
        }
        if queued > 0 {
            debug!("queued {} repair tasks for {}", queued, chunk_id);
        }
        queued
    }

    /// Reconstruction recipe for an erasure block with no surviving copy.
    fn build_ec_repair_task(
        &self,
        chunk: &ChunkMeta,
        target_server: &str,
        target_address: &str,
    ) -> Option<ReplicationTask> {
        let siblings: Vec<SiblingBlock> = self
            .meta
            .group_siblings(&chunk.erasure_group_id, &chunk.chunk_id)
            .into_iter()
            .filter_map(|sibling| {
                let server = sibling.server_locations.iter().find(|s| {
                    self.meta
                        .get_server(s)
                        .map(|server| server.is_healthy)
                        .unwrap_or(false)
                })?;
                let address = self.meta.server_address(server)?;
                Some(SiblingBlock {
                    chunk_id: sibling.chunk_id.clone(),
                    block_index: sibling.erasure_block_index as usize,
                    address,
                })
            })
            .collect();
        if siblings.len() < self.ec_data_blocks {
            return None;
        }
        Some(ReplicationTask {
            chunk_id: chunk.chunk_id.clone(),
            source_server: String::new(),
            source_address: String::new(),
            target_server: target_server.to_string(),
            target_address: target_address.to_string(),
            is_urgent: true,
            ec_repair: Some(EcRepairTask {
                group_id: chunk.erasure_group_id.clone(),
                block_index: chunk.erasure_block_index as usize,
                data_blocks: self.ec_data_blocks,
                parity_blocks: self.ec_parity_blocks,
                siblings,
            }),
        })
    }

    /// Re-queue repair for every under-replicated chunk of a completed file.
    pub fn repair_under_replicated(&self) -> usize {
        let mut queued = 0;
        for file in self.meta.list_files("").iter().filter(|f| f.completed) {
            for chunk_id in &file.chunk_ids {
                queued += self.repair_chunk(chunk_id);
            }
        }
        queued
    }

    // ---- rebalance ----

    /// Population standard deviation of healthy-server loads.
    pub fn cluster_load_stddev(&self) -> f64 {
        let servers = self.meta.healthy_servers();
        if servers.len() < 2 {
            return 0.0;
        }
        let loads: Vec<f64> = servers.iter().map(ServerMeta::load).collect();
        let mean = loads.iter().sum::<f64>() / loads.len() as f64;
        let variance =
            loads.iter().map(|l| (l - mean) * (l - mean)).sum::<f64>() / loads.len() as f64;
        variance.sqrt()
    }

    pub fn should_rebalance(&self) -> bool {
        if self.cluster_load_stddev() > LOAD_STDDEV_THRESHOLD {
            return true;
        }
        self.meta
            .healthy_servers()
            .iter()
            .any(|s| s.load() > OVERLOAD_THRESHOLD)
    }

    /// Move the least-recently-accessed chunk of each overloaded server to an
    /// underloaded one. The move is a copy; the source placement is trimmed
    /// once the target's inventory confirms the chunk.
    pub fn generate_rebalance_tasks(&self) -> usize {
        let servers = self.meta.healthy_servers();
        let mut underloaded: Vec<&ServerMeta> = servers
            .iter()
            .filter(|s| s.load() < UNDERLOAD_THRESHOLD && self.has_enough_space(s))
            .collect();
        underloaded.sort_by(|a, b| {
            b.load()
                .partial_cmp(&a.load())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut queued = 0;
        for server in servers.iter().filter(|s| s.load() > OVERLOAD_THRESHOLD) {
            let Some(target) = underloaded.pop() else {
                break;
            };
            let Some(chunk_id) = self.coldest_chunk_on(&server.server_id, &target.server_id)
            else {
                continue;
            };
            info!(
                "rebalance: moving {} from {} to {}",
                chunk_id, server.server_id, target.server_id
            );
            self.meta.queue_replication(ReplicationTask {
                chunk_id,
                source_server: server.server_id.clone(),
                source_address: server.endpoint(),
                target_server: target.server_id.clone(),
                target_address: target.endpoint(),
                is_urgent: false,
                ec_repair: None,
            });
            queued += 1;
        }
        queued
    }

    fn coldest_chunk_on(&self, server_id: &str, exclude_target: &str) -> Option<String> {
        self.meta
            .chunks_on_server(server_id)
            .into_iter()
            .filter_map(|id| self.meta.get_chunk(&id))
            .filter(|c| !c.server_locations.iter().any(|s| s == exclude_target))
            .min_by_key(|c| c.last_accessed_time)
            .map(|c| c.chunk_id)
    }

    /// Drop surplus placements once every holder has confirmed the chunk:
    /// the most loaded confirmed holder gives its copy up. This is the back
    /// half of a rebalance move.
    pub fn trim_over_replicated(&self) -> usize {
        let mut trimmed = 0;
        for file in self.meta.list_files("") {
            if !file.completed {
                continue;
            }
            for chunk_id in &file.chunk_ids {
                let Some(chunk) = self.meta.get_chunk(chunk_id) else {
                    continue;
                };
                let target = if chunk.is_erasure_coded {
                    1
                } else {
                    self.replication_factor
                };
                if chunk.server_locations.len() <= target {
                    continue;
                }
                let confirmed: HashSet<String> =
                    self.meta.confirmed_holders(chunk_id).into_iter().collect();
                if !chunk
                    .server_locations
                    .iter()
                    .all(|s| confirmed.contains(s))
                {
                    continue;
                }
                let victim = chunk
                    .server_locations
                    .iter()
                    .filter_map(|id| self.meta.get_server(id))
                    .max_by(|a, b| {
                        a.load()
                            .partial_cmp(&b.load())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|s| s.server_id);
                if let Some(victim) = victim {
                    info!("trimming surplus copy of {} from {}", chunk_id, victim);
                    self.meta.remove_chunk_location(chunk_id, &victim);
                    self.meta.queue_delete(&victim, chunk_id);
                    trimmed += 1;
                }
            }
        }
        trimmed
    }
}
