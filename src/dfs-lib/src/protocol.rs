//! Request/response payloads for the master and chunk-server HTTP surfaces.
//! Every response carries a `{success, message}` pair for machine callers.

use serde::{Deserialize, Serialize};

/// Header carrying a chunk's SHA-256 on chunk reads and writes.
pub const CHECKSUM_HEADER: &str = "x-dfs-checksum";
pub const ENCRYPTED_HEADER: &str = "x-dfs-encrypted";
pub const ERASURE_CODED_HEADER: &str = "x-dfs-erasure-coded";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    pub message: String,
}

impl StatusResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

// ---- file service ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFileRequest {
    pub filename: String,
    pub file_size: u64,
    pub enable_encryption: bool,
    pub enable_erasure_coding: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFileResponse {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub file_id: String,
    /// Minted key material, returned once to the uploading client when
    /// encryption was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    #[serde(default)]
    pub encryption_key_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFileRequest {
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub chunk_id: String,
    /// `host:port` endpoints, in placement order.
    pub server_addresses: Vec<String>,
    pub size: u64,
    #[serde(default)]
    pub checksum: String,
    pub is_erasure_coded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub created_time: u64,
    pub modified_time: u64,
    pub is_encrypted: bool,
    #[serde(default)]
    pub encryption_key_id: String,
    pub is_erasure_coded: bool,
    /// Erasure parameters of this file's groups; zero when not erasure-coded.
    #[serde(default)]
    pub ec_data_blocks: usize,
    #[serde(default)]
    pub ec_parity_blocks: usize,
    pub chunks: Vec<ChunkInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub success: bool,
    pub message: String,
    pub files: Vec<FileInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFileInfoResponse {
    pub success: bool,
    pub message: String,
    pub file: Option<FileInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateChunksRequest {
    pub file_id: String,
    pub chunk_count: usize,
    pub enable_erasure_coding: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateChunksResponse {
    pub success: bool,
    pub message: String,
    pub allocated_chunks: Vec<ChunkInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkLocationsRequest {
    pub chunk_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkLocationsResponse {
    pub success: bool,
    pub message: String,
    pub chunks: Vec<ChunkInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteUploadRequest {
    pub file_id: String,
    pub uploaded_chunk_ids: Vec<String>,
}

// ---- chunk management ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterChunkServerRequest {
    pub server_id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub zone: String,
    pub total_space: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub server_id: String,
    pub free_space: u64,
    pub chunk_count: u64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub stored_chunks: Vec<String>,
}

/// Reconstruction recipe piggybacked on a replication task when the chunk is
/// an erasure block with no surviving copy: the target fetches any `k`
/// sibling blocks, decodes, and re-encodes the missing one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcRepairTask {
    pub group_id: String,
    pub block_index: usize,
    pub data_blocks: usize,
    pub parity_blocks: usize,
    pub siblings: Vec<SiblingBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiblingBlock {
    pub chunk_id: String,
    pub block_index: usize,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub chunk_id: String,
    pub source_server: String,
    pub source_address: String,
    pub target_server: String,
    pub target_address: String,
    pub is_urgent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ec_repair: Option<EcRepairTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    #[serde(default)]
    pub replication_tasks: Vec<ReplicationTask>,
    #[serde(default)]
    pub chunks_to_delete: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateChunkRequest {
    pub chunk_id: String,
    pub source_server: String,
    pub target_server: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteChunkRequest {
    pub chunk_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportCorruptionRequest {
    pub chunk_id: String,
    pub server_id: String,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportCorruptionResponse {
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsResponse {
    pub total_files: u64,
    pub total_chunks: u64,
    pub total_servers: u64,
    pub healthy_servers: u64,
    pub total_storage_used: u64,
    pub total_storage_available: u64,
    pub average_replication_factor: f64,
}

// ---- chunk server data path ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteChunkResponse {
    pub success: bool,
    #[serde(default)]
    pub stored_checksum: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityResponse {
    pub is_valid: bool,
    #[serde(default)]
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyChunkRequest {
    pub chunk_id: String,
    pub source_address: String,
}
