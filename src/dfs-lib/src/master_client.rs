use log::{debug, warn};
use rand::Rng;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::{
    AllocateChunksRequest, AllocateChunksResponse, ChunkLocationsRequest, ChunkLocationsResponse,
    CompleteUploadRequest, CreateFileRequest, CreateFileResponse, DeleteChunkRequest,
    DeleteFileRequest, DfsError, DfsResult, GetFileInfoResponse, HeartbeatRequest,
    HeartbeatResponse, ListFilesResponse, RegisterChunkServerRequest, ReplicateChunkRequest,
    ReportCorruptionRequest, ReportCorruptionResponse, StatsResponse, StatusResponse,
};

const RETRY_LIMIT: usize = 3;
const RETRY_BASE_DELAY_MS: u64 = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed HTTP client for the master's file-service and chunk-management
/// endpoints. Transient failures are retried up to three times with jittered
/// backoff.
#[derive(Clone)]
pub struct MasterClient {
    base_url: String,
    http: Client,
}

impl MasterClient {
    /// `endpoint` is `host:port`.
    pub fn new(endpoint: &str) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: format!("http://{}", endpoint),
            http,
        }
    }

    pub async fn create_file(&self, req: &CreateFileRequest) -> DfsResult<CreateFileResponse> {
        self.post_json("/api/create_file", req).await
    }

    pub async fn delete_file(&self, filename: &str) -> DfsResult<StatusResponse> {
        let req = DeleteFileRequest {
            filename: filename.to_string(),
        };
        self.post_json("/api/delete_file", &req).await
    }

    pub async fn list_files(&self, prefix: &str) -> DfsResult<ListFilesResponse> {
        let url = format!("{}/api/list_files", self.base_url);
        self.get_json(&url, &[("prefix", prefix)]).await
    }

    pub async fn get_file_info(&self, filename: &str) -> DfsResult<GetFileInfoResponse> {
        let url = format!("{}/api/file_info", self.base_url);
        self.get_json(&url, &[("filename", filename)]).await
    }

    pub async fn allocate_chunks(
        &self,
        req: &AllocateChunksRequest,
    ) -> DfsResult<AllocateChunksResponse> {
        self.post_json("/api/allocate_chunks", req).await
    }

    pub async fn chunk_locations(
        &self,
        chunk_ids: Vec<String>,
    ) -> DfsResult<ChunkLocationsResponse> {
        let req = ChunkLocationsRequest { chunk_ids };
        self.post_json("/api/chunk_locations", &req).await
    }

    pub async fn complete_upload(
        &self,
        req: &CompleteUploadRequest,
    ) -> DfsResult<StatusResponse> {
        self.post_json("/api/complete_upload", req).await
    }

    pub async fn register_server(
        &self,
        req: &RegisterChunkServerRequest,
    ) -> DfsResult<StatusResponse> {
        self.post_json("/api/register", req).await
    }

    /// Heartbeats are fired on a tight period; a failed one is simply dropped
    /// and the next tick tries again.
    pub async fn send_heartbeat(&self, req: &HeartbeatRequest) -> DfsResult<HeartbeatResponse> {
        let url = format!("{}/api/heartbeat", self.base_url);
        self.post_once(&url, req).await
    }

    pub async fn replicate_chunk(
        &self,
        req: &ReplicateChunkRequest,
    ) -> DfsResult<StatusResponse> {
        self.post_json("/api/replicate_chunk", req).await
    }

    pub async fn delete_chunk(&self, chunk_id: &str) -> DfsResult<StatusResponse> {
        let req = DeleteChunkRequest {
            chunk_id: chunk_id.to_string(),
        };
        self.post_json("/api/delete_chunk", &req).await
    }

    pub async fn report_corruption(
        &self,
        req: &ReportCorruptionRequest,
    ) -> DfsResult<ReportCorruptionResponse> {
        self.post_json("/api/report_corruption", req).await
    }

    pub async fn stats(&self) -> DfsResult<StatsResponse> {
        let url = format!("{}/api/stats", self.base_url);
        self.get_json(&url, &[]).await
    }

    async fn post_json<Req, Resp>(&self, path: &str, req: &Req) -> DfsResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;
        for attempt in 0..RETRY_LIMIT {
            if attempt > 0 {
                let jitter = rand::thread_rng().gen_range(0..RETRY_BASE_DELAY_MS);
                let delay = RETRY_BASE_DELAY_MS * attempt as u64 + jitter;
                debug!("retrying {} in {} ms (attempt {})", url, delay, attempt + 1);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            match self.post_once(&url, req).await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_retryable() => {
                    warn!("request to {} failed: {}", url, err);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| DfsError::Transient(format!("request to {} failed", url))))
    }

    async fn post_once<Req, Resp>(&self, url: &str, req: &Req) -> DfsResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let resp = self.http.post(url).json(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DfsError::from_http_status(status, body));
        }
        Ok(resp.json::<Resp>().await?)
    }

    async fn get_json<Resp>(&self, url: &str, query: &[(&str, &str)]) -> DfsResult<Resp>
    where
        Resp: DeserializeOwned,
    {
        let resp = self.http.get(url).query(query).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DfsError::from_http_status(status, body));
        }
        Ok(resp.json::<Resp>().await?)
    }
}
