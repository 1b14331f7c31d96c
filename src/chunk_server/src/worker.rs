use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;

use dfs_lib::{
    sha256_hex, CodeGroup, CodeGroupCodec, CodedBlock, DfsError, DfsResult, EcRepairTask,
    HeartbeatRequest, ReplicationTask,
};

use crate::service::{report_corruption, ServerState};
use crate::system_metrics;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Push inventory and resource metrics to the master every tick; apply the
/// piggybacked instructions from the response. Deletions are applied
/// immediately, replication tasks go to the worker queue.
pub async fn run_heartbeat_loop(state: Arc<ServerState>, interval_ms: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;

        let request = HeartbeatRequest {
            server_id: state.server_id.clone(),
            free_space: state.store.free_space(),
            chunk_count: state.store.chunk_count().await,
            cpu_usage: system_metrics::cpu_usage(),
            memory_usage: system_metrics::memory_usage(),
            stored_chunks: state.store.all_chunk_ids().await,
        };

        let response = match state.master.send_heartbeat(&request).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("heartbeat failed: {}", e);
                continue;
            }
        };
        if !response.success {
            // A restarted master may have forgotten us; re-register and
            // carry on with the next tick.
            warn!("master rejected heartbeat, re-registering");
            if let Err(e) = state.master.register_server(&state.register).await {
                warn!("re-registration failed: {}", e);
            }
            continue;
        }

        for task in response.replication_tasks {
            if state.repl_tx.send(task).is_err() {
                warn!("replication worker gone, dropping task");
            }
        }

        for chunk_id in response.chunks_to_delete {
            match state.store.delete_chunk(&chunk_id).await {
                Ok(()) => info!("deleted chunk {} as instructed by master", chunk_id),
                Err(DfsError::NotFound(_)) => {}
                // A write in flight or an I/O hiccup: the master re-sends
                // the deletion on a later heartbeat.
                Err(e) => warn!("deferred deletion of {}: {}", chunk_id, e),
            }
        }
    }
}

/// Drain the replication queue FIFO. This server acts only when it is the
/// task's target; the source side requires nothing of us.
pub async fn run_replication_worker(
    state: Arc<ServerState>,
    mut queue: UnboundedReceiver<ReplicationTask>,
) {
    while let Some(task) = queue.recv().await {
        if task.target_server != state.server_id {
            debug!("serving as replication source for {}", task.chunk_id);
            continue;
        }
        if state.store.chunk_exists(&task.chunk_id).await {
            debug!("already hold {}, task is a no-op", task.chunk_id);
            continue;
        }

        let result = match &task.ec_repair {
            Some(repair) => reconstruct_block(&state, &task.chunk_id, repair).await,
            None => copy_from_server(&state, &task.chunk_id, &task.source_address).await,
        };
        match result {
            Ok(()) => info!("replication of {} completed", task.chunk_id),
            // The master re-emits the task on its next repair sweep.
            Err(e) => warn!("replication of {} failed: {}", task.chunk_id, e),
        }
    }
}

/// Verified read from the source server, then a local write preserving the
/// chunk's flags.
pub async fn copy_from_server(
    state: &ServerState,
    chunk_id: &str,
    source_address: &str,
) -> DfsResult<()> {
    if source_address.is_empty() {
        return Err(DfsError::InvalidArgument(
            "copy task without a source address".to_string(),
        ));
    }
    let download = state
        .chunks
        .read_chunk_detailed(source_address, chunk_id, true)
        .await?;
    let checksum = sha256_hex(&download.data);
    state
        .store
        .write_chunk(
            chunk_id,
            &download.data,
            Some(&checksum),
            download.is_encrypted,
            download.is_erasure_coded,
        )
        .await?;
    Ok(())
}

/// Rebuild a lost erasure block from `k` of its siblings and store it
/// locally.
async fn reconstruct_block(
    state: &ServerState,
    chunk_id: &str,
    repair: &EcRepairTask,
) -> DfsResult<()> {
    let codec = CodeGroupCodec::new(repair.data_blocks, repair.parity_blocks)?;

    let mut blocks: Vec<CodedBlock> = Vec::with_capacity(repair.data_blocks);
    let mut is_encrypted = false;
    for sibling in &repair.siblings {
        if blocks.len() >= repair.data_blocks {
            break;
        }
        match state
            .chunks
            .read_chunk_detailed(&sibling.address, &sibling.chunk_id, true)
            .await
        {
            Ok(download) => {
                is_encrypted = download.is_encrypted;
                blocks.push(CodedBlock {
                    chunk_id: sibling.chunk_id.clone(),
                    block_index: sibling.block_index,
                    is_parity: sibling.block_index >= repair.data_blocks,
                    checksum: sha256_hex(&download.data),
                    data: download.data,
                });
            }
            Err(e) => warn!(
                "sibling {} from {} unavailable: {}",
                sibling.chunk_id, sibling.address, e
            ),
        }
    }
    if blocks.len() < repair.data_blocks {
        return Err(DfsError::IntegrityFailure(format!(
            "only {} of {} sibling blocks reachable for {}",
            blocks.len(),
            repair.data_blocks,
            chunk_id
        )));
    }

    let group = CodeGroup {
        group_id: repair.group_id.clone(),
        data_blocks: repair.data_blocks,
        parity_blocks: repair.parity_blocks,
        // Only the padded layout matters for block regeneration.
        original_size: 0,
        blocks,
    };
    let rebuilt = codec.repair_group(&group, &[repair.block_index])?;
    let block = rebuilt.into_iter().next().ok_or_else(|| {
        DfsError::IntegrityFailure(format!("reconstruction of {} produced nothing", chunk_id))
    })?;

    state
        .store
        .write_chunk(chunk_id, &block.data, Some(&block.checksum), is_encrypted, true)
        .await?;
    info!(
        "reconstructed erasure block {} from {} siblings",
        chunk_id, repair.data_blocks
    );
    Ok(())
}

/// Every five minutes: verify every stored chunk, purge what fails, surface
/// corruption to the master so repair gets scheduled.
pub async fn run_maintenance_loop(state: Arc<ServerState>) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup stays quick.
    ticker.tick().await;
    loop {
        ticker.tick().await;

        match state.store.scan().await {
            Ok(report) => {
                for chunk_id in &report.corrupted {
                    report_corruption(&state, chunk_id, "maintenance scan found corrupt bytes")
                        .await;
                }
                for chunk_id in &report.missing {
                    report_corruption(&state, chunk_id, "data file missing").await;
                }
            }
            Err(e) => warn!("maintenance scan failed: {}", e),
        }
    }
}
