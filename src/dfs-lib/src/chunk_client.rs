use log::warn;
use reqwest::Client;
use std::time::Duration;

use crate::{
    sha256_hex, CopyChunkRequest, DfsError, DfsResult, IntegrityResponse, StatusResponse,
    WriteChunkResponse, CHECKSUM_HEADER, ENCRYPTED_HEADER, ERASURE_CODED_HEADER,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A fetched chunk body plus the flags its server recorded for it.
pub struct ChunkDownload {
    pub data: Vec<u8>,
    pub is_encrypted: bool,
    pub is_erasure_coded: bool,
}

/// HTTP client for the chunk-server data path. Chunk bodies travel raw; the
/// checksum rides in the `x-dfs-checksum` header.
#[derive(Clone)]
pub struct ChunkClient {
    http: Client,
}

impl ChunkClient {
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Store `data` under `chunk_id` on the server at `address` (`host:port`).
    /// The server recomputes the checksum and rejects mismatches before
    /// writing.
    pub async fn write_chunk(
        &self,
        address: &str,
        chunk_id: &str,
        data: Vec<u8>,
        checksum: &str,
        is_encrypted: bool,
        is_erasure_coded: bool,
    ) -> DfsResult<WriteChunkResponse> {
        let url = format!("http://{}/chunk/{}", address, chunk_id);
        let resp = self
            .http
            .post(&url)
            .header(CHECKSUM_HEADER, checksum)
            .header(ENCRYPTED_HEADER, if is_encrypted { "1" } else { "0" })
            .header(ERASURE_CODED_HEADER, if is_erasure_coded { "1" } else { "0" })
            .body(data)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DfsError::from_http_status(status, body));
        }
        Ok(resp.json::<WriteChunkResponse>().await?)
    }

    /// Fetch a chunk, verifying its SHA-256 against the server-advertised
    /// value. A mismatch is an `IntegrityFailure` so the caller can fall over
    /// to the next replica.
    pub async fn read_chunk(
        &self,
        address: &str,
        chunk_id: &str,
        verify: bool,
    ) -> DfsResult<Vec<u8>> {
        Ok(self.read_chunk_detailed(address, chunk_id, verify).await?.data)
    }

    /// Like [`read_chunk`], but also returns the chunk's stored flags so a
    /// server-to-server copy can preserve them.
    pub async fn read_chunk_detailed(
        &self,
        address: &str,
        chunk_id: &str,
        verify: bool,
    ) -> DfsResult<ChunkDownload> {
        let url = format!(
            "http://{}/chunk/{}?verify={}",
            address, chunk_id, verify
        );
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DfsError::from_http_status(status, body));
        }

        let header_flag = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v == "1")
                .unwrap_or(false)
        };
        let is_encrypted = header_flag(ENCRYPTED_HEADER);
        let is_erasure_coded = header_flag(ERASURE_CODED_HEADER);
        let advertised = resp
            .headers()
            .get(CHECKSUM_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let data = resp.bytes().await?.to_vec();

        if let Some(expected) = advertised {
            let actual = sha256_hex(&data);
            if actual != expected {
                warn!(
                    "chunk {} from {}: checksum mismatch (expected {}, got {})",
                    chunk_id, address, expected, actual
                );
                return Err(DfsError::IntegrityFailure(format!(
                    "chunk {} from {} failed checksum verification",
                    chunk_id, address
                )));
            }
        }
        Ok(ChunkDownload {
            data,
            is_encrypted,
            is_erasure_coded,
        })
    }

    pub async fn check_integrity(
        &self,
        address: &str,
        chunk_id: &str,
    ) -> DfsResult<IntegrityResponse> {
        let url = format!("http://{}/chunk/{}/integrity", address, chunk_id);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DfsError::from_http_status(status, body));
        }
        Ok(resp.json::<IntegrityResponse>().await?)
    }

    /// Ask the server at `address` to pull `chunk_id` from `source_address`.
    pub async fn copy_chunk(
        &self,
        address: &str,
        chunk_id: &str,
        source_address: &str,
    ) -> DfsResult<StatusResponse> {
        let url = format!("http://{}/copy_chunk", address);
        let req = CopyChunkRequest {
            chunk_id: chunk_id.to_string(),
            source_address: source_address.to_string(),
        };
        let resp = self.http.post(&url).json(&req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DfsError::from_http_status(status, body));
        }
        Ok(resp.json::<StatusResponse>().await?)
    }
}

impl Default for ChunkClient {
    fn default() -> Self {
        Self::new()
    }
}
