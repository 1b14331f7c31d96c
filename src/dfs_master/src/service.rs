use axum::extract::{DefaultBodyLimit, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::Deserialize;
use std::sync::Arc;

use dfs_lib::{
    generate_file_id, generate_key_hex, key_id_for, now_ms, validate_filename,
    AllocateChunksRequest, AllocateChunksResponse, ChunkInfo, ChunkLocationsRequest,
    ChunkLocationsResponse, CompleteUploadRequest, Config, CreateFileRequest, CreateFileResponse,
    DeleteChunkRequest, DeleteFileRequest, DfsError, FileInfo, FileMeta, GetFileInfoResponse,
    HeartbeatRequest, HeartbeatResponse, KeyManager, ListFilesResponse, RegisterChunkServerRequest,
    ReplicateChunkRequest, ReplicationTask, ReportCorruptionRequest, ReportCorruptionResponse,
    ServerMeta, StatsResponse, StatusResponse, MAX_MESSAGE_SIZE,
};

use crate::{ChunkAllocator, MetadataManager};

/// Shared state behind every master endpoint.
#[derive(Clone)]
pub struct MasterState {
    pub meta: Arc<MetadataManager>,
    pub allocator: Arc<ChunkAllocator>,
    pub keys: Arc<KeyManager>,
    pub config: Arc<Config>,
}

pub fn master_router(state: MasterState) -> Router {
    Router::new()
        // file service
        .route("/api/create_file", post(create_file))
        .route("/api/delete_file", post(delete_file))
        .route("/api/list_files", get(list_files))
        .route("/api/file_info", get(file_info))
        .route("/api/allocate_chunks", post(allocate_chunks))
        .route("/api/chunk_locations", post(chunk_locations))
        .route("/api/complete_upload", post(complete_upload))
        // chunk management
        .route("/api/register", post(register_server))
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/replicate_chunk", post(replicate_chunk))
        .route("/api/delete_chunk", post(delete_chunk))
        .route("/api/report_corruption", post(report_corruption))
        .route("/api/stats", get(stats))
        .layer(DefaultBodyLimit::max(MAX_MESSAGE_SIZE))
        .with_state(state)
}

async fn create_file(
    State(state): State<MasterState>,
    Json(req): Json<CreateFileRequest>,
) -> Json<CreateFileResponse> {
    let fail = |message: String| {
        Json(CreateFileResponse {
            success: false,
            message,
            file_id: String::new(),
            encryption_key: None,
            encryption_key_id: String::new(),
        })
    };

    if let Err(e) = validate_filename(&req.filename) {
        return fail(e.to_string());
    }

    let file_id = generate_file_id();
    let encryption_key_id = if req.enable_encryption {
        key_id_for(&file_id)
    } else {
        String::new()
    };

    let now = now_ms();
    let meta = FileMeta {
        file_id: file_id.clone(),
        filename: req.filename.clone(),
        size: req.file_size,
        created_time: now,
        modified_time: now,
        is_encrypted: req.enable_encryption,
        encryption_key_id: encryption_key_id.clone(),
        is_erasure_coded: req.enable_erasure_coding,
        chunk_ids: Vec::new(),
        completed: false,
    };
    if let Err(e) = state.meta.create_file(meta) {
        return fail(e.to_string());
    }

    let mut encryption_key = None;
    if req.enable_encryption {
        let key = generate_key_hex();
        state.keys.store_key(&encryption_key_id, &key);
        encryption_key = Some(key);
    }

    Json(CreateFileResponse {
        success: true,
        message: "file created".to_string(),
        file_id,
        encryption_key,
        encryption_key_id,
    })
}

async fn delete_file(
    State(state): State<MasterState>,
    Json(req): Json<DeleteFileRequest>,
) -> Json<StatusResponse> {
    match state.meta.delete_file(&req.filename) {
        Ok(_) => Json(StatusResponse::ok("file deleted")),
        Err(e) => Json(StatusResponse::error(e.to_string())),
    }
}

#[derive(Deserialize)]
struct ListFilesQuery {
    #[serde(default)]
    prefix: String,
}

async fn list_files(
    State(state): State<MasterState>,
    Query(query): Query<ListFilesQuery>,
) -> Json<ListFilesResponse> {
    let files = state
        .meta
        .list_files(&query.prefix)
        .into_iter()
        .map(|f| build_file_info(&state, &f))
        .collect();
    Json(ListFilesResponse {
        success: true,
        message: String::new(),
        files,
    })
}

#[derive(Deserialize)]
struct FileInfoQuery {
    filename: String,
}

async fn file_info(
    State(state): State<MasterState>,
    Query(query): Query<FileInfoQuery>,
) -> Json<GetFileInfoResponse> {
    match state.meta.get_file(&query.filename) {
        Some(meta) => Json(GetFileInfoResponse {
            success: true,
            message: String::new(),
            file: Some(build_file_info(&state, &meta)),
        }),
        None => Json(GetFileInfoResponse {
            success: false,
            message: DfsError::NotFound(format!("file not found: {}", query.filename))
                .to_string(),
            file: None,
        }),
    }
}

async fn allocate_chunks(
    State(state): State<MasterState>,
    Json(req): Json<AllocateChunksRequest>,
) -> Json<AllocateChunksResponse> {
    let fail = |message: String| {
        Json(AllocateChunksResponse {
            success: false,
            message,
            allocated_chunks: Vec::new(),
        })
    };

    let Some(file) = state.meta.file_by_id(&req.file_id) else {
        return fail(
            DfsError::NotFound(format!("file id not found: {}", req.file_id)).to_string(),
        );
    };
    if !file.chunk_ids.is_empty() {
        return fail(
            DfsError::AlreadyExists(format!("chunks already allocated for {}", req.file_id))
                .to_string(),
        );
    }

    let expected = file.size.div_ceil(state.config.chunk_size) as usize;
    if req.chunk_count != expected {
        return fail(
            DfsError::InvalidArgument(format!(
                "chunk count mismatch: requested {}, file size implies {}",
                req.chunk_count, expected
            ))
            .to_string(),
        );
    }

    let allocated = match state
        .allocator
        .allocate_chunks(&req.file_id, file.size, req.enable_erasure_coding)
    {
        Ok(chunks) => chunks,
        Err(e) => return fail(e.to_string()),
    };

    let chunk_ids: Vec<String> = allocated.iter().map(|c| c.chunk_id.clone()).collect();
    if let Err(e) = state.meta.append_file_chunks(&req.file_id, &chunk_ids) {
        return fail(e.to_string());
    }

    Json(AllocateChunksResponse {
        success: true,
        message: "chunks allocated".to_string(),
        allocated_chunks: allocated,
    })
}

async fn chunk_locations(
    State(state): State<MasterState>,
    Json(req): Json<ChunkLocationsRequest>,
) -> Json<ChunkLocationsResponse> {
    let chunks = req
        .chunk_ids
        .iter()
        .filter_map(|id| state.meta.get_chunk(id))
        .map(|c| build_chunk_info(&state, &c))
        .collect();
    Json(ChunkLocationsResponse {
        success: true,
        message: String::new(),
        chunks,
    })
}

async fn complete_upload(
    State(state): State<MasterState>,
    Json(req): Json<CompleteUploadRequest>,
) -> Json<StatusResponse> {
    match state
        .meta
        .mark_upload_complete(&req.file_id, &req.uploaded_chunk_ids)
    {
        Ok(file) => {
            info!("upload of {} completed", file.filename);
            Json(StatusResponse::ok("upload completed"))
        }
        Err(e) => Json(StatusResponse::error(e.to_string())),
    }
}

async fn register_server(
    State(state): State<MasterState>,
    Json(req): Json<RegisterChunkServerRequest>,
) -> Json<StatusResponse> {
    let meta = ServerMeta {
        server_id: req.server_id.clone(),
        address: req.address.clone(),
        port: req.port,
        zone: if req.zone.is_empty() {
            "default".to_string()
        } else {
            req.zone.clone()
        },
        total_space: req.total_space,
        free_space: req.total_space,
        chunk_count: 0,
        cpu_usage: 0.0,
        memory_usage: 0.0,
        is_healthy: true,
        last_heartbeat: now_ms(),
        stored_chunks: Default::default(),
    };
    match state.meta.register_server(meta) {
        Ok(()) => Json(StatusResponse::ok("server registered")),
        Err(e) => Json(StatusResponse::error(e.to_string())),
    }
}

async fn heartbeat(
    State(state): State<MasterState>,
    Json(req): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    match state.meta.heartbeat(&req) {
        Ok((replication_tasks, chunks_to_delete)) => Json(HeartbeatResponse {
            success: true,
            replication_tasks,
            chunks_to_delete,
        }),
        Err(e) => {
            warn!("heartbeat from {} rejected: {}", req.server_id, e);
            Json(HeartbeatResponse {
                success: false,
                replication_tasks: Vec::new(),
                chunks_to_delete: Vec::new(),
            })
        }
    }
}

async fn replicate_chunk(
    State(state): State<MasterState>,
    Json(req): Json<ReplicateChunkRequest>,
) -> Json<StatusResponse> {
    let (Some(source_address), Some(target_address)) = (
        state.meta.server_address(&req.source_server),
        state.meta.server_address(&req.target_server),
    ) else {
        return Json(StatusResponse::error("unknown source or target server"));
    };
    if state.meta.get_chunk(&req.chunk_id).is_none() {
        return Json(StatusResponse::error(format!(
            "chunk not found: {}",
            req.chunk_id
        )));
    }
    state.meta.queue_replication(ReplicationTask {
        chunk_id: req.chunk_id,
        source_server: req.source_server,
        source_address,
        target_server: req.target_server,
        target_address,
        is_urgent: true,
        ec_repair: None,
    });
    Json(StatusResponse::ok("replication scheduled"))
}

async fn delete_chunk(
    State(state): State<MasterState>,
    Json(req): Json<DeleteChunkRequest>,
) -> Json<StatusResponse> {
    match state.meta.remove_chunk(&req.chunk_id) {
        Ok(()) => Json(StatusResponse::ok("chunk deleted")),
        Err(e) => Json(StatusResponse::error(e.to_string())),
    }
}

async fn report_corruption(
    State(state): State<MasterState>,
    Json(req): Json<ReportCorruptionRequest>,
) -> Json<ReportCorruptionResponse> {
    warn!(
        "corruption reported for {} on {}: {}",
        req.chunk_id, req.server_id, req.details
    );
    state
        .allocator
        .handle_corruption(&req.chunk_id, &req.server_id);
    Json(ReportCorruptionResponse { acknowledged: true })
}

async fn stats(State(state): State<MasterState>) -> Json<StatsResponse> {
    Json(state.meta.statistics())
}

fn build_chunk_info(state: &MasterState, chunk: &dfs_lib::ChunkMeta) -> ChunkInfo {
    let server_addresses = chunk
        .server_locations
        .iter()
        .filter_map(|id| state.meta.server_address(id))
        .collect();
    ChunkInfo {
        chunk_id: chunk.chunk_id.clone(),
        server_addresses,
        size: chunk.size,
        checksum: chunk.checksum.clone(),
        is_erasure_coded: chunk.is_erasure_coded,
    }
}

fn build_file_info(state: &MasterState, file: &FileMeta) -> FileInfo {
    let chunks = file
        .chunk_ids
        .iter()
        .filter_map(|id| state.meta.get_chunk(id))
        .map(|c| build_chunk_info(state, &c))
        .collect();
    let (k, m) = if file.is_erasure_coded {
        state.allocator.ec_params()
    } else {
        (0, 0)
    };
    FileInfo {
        file_id: file.file_id.clone(),
        filename: file.filename.clone(),
        size: file.size,
        created_time: file.created_time,
        modified_time: file.modified_time,
        is_encrypted: file.is_encrypted,
        encryption_key_id: file.encryption_key_id.clone(),
        is_erasure_coded: file.is_erasure_coded,
        ec_data_blocks: k,
        ec_parity_blocks: m,
        chunks,
    }
}
