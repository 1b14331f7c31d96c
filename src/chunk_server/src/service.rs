use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, warn};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use chunk_store::ChunkStore;
use dfs_lib::{
    ChunkClient, DfsError, IntegrityResponse, MasterClient, RegisterChunkServerRequest,
    ReplicationTask, ReportCorruptionRequest, StatusResponse, WriteChunkResponse,
    CHECKSUM_HEADER, ENCRYPTED_HEADER, ERASURE_CODED_HEADER, MAX_MESSAGE_SIZE,
};

pub struct ServerState {
    pub server_id: String,
    /// Kept around so the heartbeat loop can re-register after a master
    /// restart that forgot us.
    pub register: RegisterChunkServerRequest,
    pub store: Arc<ChunkStore>,
    pub master: MasterClient,
    pub chunks: ChunkClient,
    pub repl_tx: UnboundedSender<ReplicationTask>,
}

pub fn chunk_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/chunk/:chunk_id", post(write_chunk).get(read_chunk))
        .route("/chunk/:chunk_id/integrity", get(check_integrity))
        .route("/copy_chunk", post(copy_chunk))
        .layer(DefaultBodyLimit::max(MAX_MESSAGE_SIZE))
        .with_state(state)
}

fn error_status(err: &DfsError) -> StatusCode {
    match err {
        DfsError::NotFound(_) => StatusCode::NOT_FOUND,
        DfsError::AlreadyExists(_) => StatusCode::CONFLICT,
        DfsError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        DfsError::IntegrityFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DfsError::StorageFull(_) => StatusCode::INSUFFICIENT_STORAGE,
        DfsError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

async fn write_chunk(
    State(state): State<Arc<ServerState>>,
    Path(chunk_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WriteChunkResponse>) {
    let expected = headers
        .get(CHECKSUM_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let is_encrypted = header_flag(&headers, ENCRYPTED_HEADER);
    let is_erasure_coded = header_flag(&headers, ERASURE_CODED_HEADER);

    match state
        .store
        .write_chunk(
            &chunk_id,
            &body,
            expected.as_deref(),
            is_encrypted,
            is_erasure_coded,
        )
        .await
    {
        Ok(stored_checksum) => (
            StatusCode::OK,
            Json(WriteChunkResponse {
                success: true,
                stored_checksum,
                message: "chunk written".to_string(),
            }),
        ),
        Err(e) => {
            warn!("write of {} failed: {}", chunk_id, e);
            (
                error_status(&e),
                Json(WriteChunkResponse {
                    success: false,
                    stored_checksum: String::new(),
                    message: e.to_string(),
                }),
            )
        }
    }
}

#[derive(Deserialize)]
struct ReadQuery {
    #[serde(default)]
    verify: bool,
}

async fn read_chunk(
    State(state): State<Arc<ServerState>>,
    Path(chunk_id): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Response {
    match state.store.read_chunk(&chunk_id, query.verify).await {
        Ok(data) => {
            let checksum = state
                .store
                .chunk_checksum(&chunk_id)
                .await
                .unwrap_or_default();
            let (is_encrypted, is_erasure_coded) = match state.store.load_sidecar(&chunk_id).await
            {
                Ok(sidecar) => (sidecar.is_encrypted, sidecar.is_erasure_coded),
                Err(_) => (false, false),
            };
            (
                [
                    (CHECKSUM_HEADER, checksum),
                    (ENCRYPTED_HEADER, if is_encrypted { "1" } else { "0" }.to_string()),
                    (
                        ERASURE_CODED_HEADER,
                        if is_erasure_coded { "1" } else { "0" }.to_string(),
                    ),
                ],
                data,
            )
                .into_response()
        }
        Err(e) => {
            // A verified read that hit corruption is worth telling the
            // master about, but not worth making the reader wait for.
            if matches!(e, DfsError::IntegrityFailure(_)) {
                let state = state.clone();
                let chunk_id = chunk_id.clone();
                let details = e.to_string();
                tokio::spawn(async move {
                    report_corruption(&state, &chunk_id, &details).await;
                });
            }
            (error_status(&e), Json(StatusResponse::error(e.to_string()))).into_response()
        }
    }
}

async fn check_integrity(
    State(state): State<Arc<ServerState>>,
    Path(chunk_id): Path<String>,
) -> (StatusCode, Json<IntegrityResponse>) {
    match state.store.check_integrity(&chunk_id).await {
        Ok((is_valid, checksum)) => (
            StatusCode::OK,
            Json(IntegrityResponse { is_valid, checksum }),
        ),
        Err(e) => (
            error_status(&e),
            Json(IntegrityResponse {
                is_valid: false,
                checksum: String::new(),
            }),
        ),
    }
}

async fn copy_chunk(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<dfs_lib::CopyChunkRequest>,
) -> (StatusCode, Json<StatusResponse>) {
    debug!("copy of {} from {} requested", req.chunk_id, req.source_address);
    match crate::worker::copy_from_server(&state, &req.chunk_id, &req.source_address).await {
        Ok(()) => (StatusCode::OK, Json(StatusResponse::ok("chunk copied"))),
        Err(e) => {
            warn!(
                "copy of {} from {} failed: {}",
                req.chunk_id, req.source_address, e
            );
            (error_status(&e), Json(StatusResponse::error(e.to_string())))
        }
    }
}

pub(crate) async fn report_corruption(state: &ServerState, chunk_id: &str, details: &str) {
    let req = ReportCorruptionRequest {
        chunk_id: chunk_id.to_string(),
        server_id: state.server_id.clone(),
        details: details.to_string(),
    };
    if let Err(e) = state.master.report_corruption(&req).await {
        warn!("corruption report for {} failed: {}", chunk_id, e);
    }
}
