use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{ChunkAllocator, MetadataManager, UPLOAD_DEADLINE_MS};
use dfs_lib::Config;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const REBALANCE_INTERVAL: Duration = Duration::from_secs(60);
const PERSIST_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the master's three background loops: heartbeat-timeout sweeper,
/// rebalance evaluator, and metadata persistence. Each takes the metadata
/// write lock only for the work of a single tick.
pub fn spawn_background_tasks(
    meta: Arc<MetadataManager>,
    allocator: Arc<ChunkAllocator>,
    config: Arc<Config>,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_health_sweeper(meta.clone(), allocator.clone(), config),
        spawn_rebalancer(allocator),
        spawn_persister(meta),
    ]
}

fn spawn_health_sweeper(
    meta: Arc<MetadataManager>,
    allocator: Arc<ChunkAllocator>,
    config: Arc<Config>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let timeout = config.heartbeat_timeout_ms;
            for server_id in meta.overdue_servers(timeout) {
                warn!("server {} missed its heartbeat window", server_id);
                allocator.handle_server_failure(&server_id);
            }

            let dead = meta.cleanup_dead_servers(timeout);
            for server_id in dead {
                info!("expired long-dead server {}", server_id);
            }

            let queued = allocator.repair_under_replicated();
            if queued > 0 {
                info!("repair sweep queued {} replication tasks", queued);
            }
        }
    })
}

fn spawn_rebalancer(allocator: Arc<ChunkAllocator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REBALANCE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let trimmed = allocator.trim_over_replicated();
            if trimmed > 0 {
                info!("rebalance trimmed {} surplus copies", trimmed);
            }
            if allocator.should_rebalance() {
                info!(
                    "cluster load stddev {:.3}, generating rebalance tasks",
                    allocator.cluster_load_stddev()
                );
                let moved = allocator.generate_rebalance_tasks();
                info!("rebalance queued {} move tasks", moved);
            }
        }
    })
}

fn spawn_persister(meta: Arc<MetadataManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PERSIST_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let removed = meta.cleanup_orphaned_chunks();
            if removed > 0 {
                info!("cleaned {} orphaned chunks", removed);
            }
            let swept = meta.sweep_stale_uploads(UPLOAD_DEADLINE_MS);
            if !swept.is_empty() {
                warn!("swept {} stale uploads", swept.len());
            }

            // Persistence failure leaves the cluster without durable
            // metadata; operator intervention is required.
            if let Err(e) = tokio::task::block_in_place(|| meta.save()) {
                error!("metadata persistence failed: {}", e);
                std::process::exit(1);
            }
        }
    })
}
