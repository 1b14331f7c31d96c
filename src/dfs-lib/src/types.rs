use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{DfsError, DfsResult};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn generate_file_id() -> String {
    format!("file_{}", random_hex(16))
}

pub fn generate_server_id() -> String {
    format!("server_{}", random_hex(8))
}

/// Positional chunk id for chunk `index` of a replicated file.
pub fn chunk_id_for(file_id: &str, index: usize) -> String {
    format!("{}_chunk_{}", file_id, index)
}

/// Group id for erasure group `group` of a file.
pub fn group_id_for(file_id: &str, group: usize) -> String {
    format!("{}_group_{}", file_id, group)
}

/// Block id for block `index` within an erasure group.
pub fn block_id_for(group_id: &str, index: usize) -> String {
    format!("{}_block_{}", group_id, index)
}

/// Key id under which a file's AES key is stored.
pub fn key_id_for(file_id: &str) -> String {
    format!("{}_key", file_id)
}

const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\0'];

/// Flat-path filename rules: non-empty, at most 255 bytes, none of `<>:"|?*`.
pub fn validate_filename(filename: &str) -> DfsResult<()> {
    if filename.is_empty() || filename.len() > 255 {
        return Err(DfsError::InvalidArgument(format!(
            "filename must be 1..=255 bytes, got {}",
            filename.len()
        )));
    }
    if filename.contains(INVALID_FILENAME_CHARS) {
        return Err(DfsError::InvalidArgument(format!(
            "filename contains forbidden character: {}",
            filename
        )));
    }
    Ok(())
}

/// Chunk ids become on-disk file names on chunk servers, so they must not
/// carry path components.
pub fn validate_chunk_id(chunk_id: &str) -> DfsResult<()> {
    if chunk_id.is_empty() || chunk_id.len() > 128 {
        return Err(DfsError::InvalidArgument(format!(
            "chunk id must be 1..=128 bytes, got {}",
            chunk_id.len()
        )));
    }
    if chunk_id.contains('/') || chunk_id.contains('\\') || chunk_id.contains("..") {
        return Err(DfsError::InvalidArgument(format!(
            "chunk id contains path components: {}",
            chunk_id
        )));
    }
    Ok(())
}

/// A file as the master records it. Immutable once `completed` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub created_time: u64,
    pub modified_time: u64,
    pub is_encrypted: bool,
    #[serde(default)]
    pub encryption_key_id: String,
    pub is_erasure_coded: bool,
    pub chunk_ids: Vec<String>,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub chunk_id: String,
    pub size: u64,
    #[serde(default)]
    pub checksum: String,
    pub is_erasure_coded: bool,
    #[serde(default)]
    pub erasure_group_id: String,
    #[serde(default)]
    pub erasure_block_index: u32,
    #[serde(default)]
    pub is_parity_block: bool,
    /// Server ids currently claiming (or allocated to hold) this chunk.
    pub server_locations: Vec<String>,
    pub created_time: u64,
    pub last_accessed_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMeta {
    pub server_id: String,
    pub address: String,
    pub port: u16,
    #[serde(default = "default_zone")]
    pub zone: String,
    pub total_space: u64,
    pub free_space: u64,
    pub chunk_count: u64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub is_healthy: bool,
    pub last_heartbeat: u64,
    #[serde(default)]
    pub stored_chunks: HashSet<String>,
}

fn default_zone() -> String {
    "default".to_string()
}

impl ServerMeta {
    /// `host:port` endpoint clients dial.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Composite load in [0, 1]: 0.5·storage + 0.3·cpu + 0.2·memory.
    pub fn load(&self) -> f64 {
        let storage = if self.total_space > 0 {
            1.0 - self.free_space as f64 / self.total_space as f64
        } else {
            0.0
        };
        0.5 * storage + 0.3 * self.cpu_usage + 0.2 * self.memory_usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_validation() {
        assert!(validate_filename("/a/b.txt").is_ok());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("bad|name").is_err());
        assert!(validate_filename("what?").is_err());
        assert!(validate_filename(&"x".repeat(256)).is_err());
        assert!(validate_filename(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn chunk_id_validation() {
        assert!(validate_chunk_id("file_ab_chunk_0").is_ok());
        assert!(validate_chunk_id("../etc/passwd").is_err());
        assert!(validate_chunk_id("a/b").is_err());
        assert!(validate_chunk_id("").is_err());
    }

    #[test]
    fn positional_ids() {
        assert_eq!(chunk_id_for("file_ab", 2), "file_ab_chunk_2");
        let gid = group_id_for("file_ab", 0);
        assert_eq!(gid, "file_ab_group_0");
        assert_eq!(block_id_for(&gid, 5), "file_ab_group_0_block_5");
    }

    #[test]
    fn server_load_weighting() {
        let server = ServerMeta {
            server_id: "s1".into(),
            address: "127.0.0.1".into(),
            port: 7001,
            zone: "default".into(),
            total_space: 100,
            free_space: 40,
            chunk_count: 0,
            cpu_usage: 0.5,
            memory_usage: 0.5,
            is_healthy: true,
            last_heartbeat: 0,
            stored_chunks: HashSet::new(),
        };
        // 0.5*0.6 + 0.3*0.5 + 0.2*0.5 = 0.55
        assert!((server.load() - 0.55).abs() < 1e-9);
    }
}
