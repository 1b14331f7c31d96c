use fs2::FileExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use dfs_lib::{now_ms, sha256_hex, validate_chunk_id, DfsError, DfsResult};

const CHECKSUM_INDEX_FILE: &str = "checksums.json";
const SIDECAR_EXT: &str = "meta";
const TMP_EXT: &str = "tmp";

/// Per-chunk sidecar, written next to the data file as `{chunk_id}.meta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSidecar {
    pub chunk_id: String,
    pub checksum: String,
    pub is_encrypted: bool,
    pub is_erasure_coded: bool,
    pub created_time: u64,
}

#[derive(Default)]
struct StoreIndex {
    checksums: HashMap<String, String>,
    last_accessed: HashMap<String, u64>,
}

/// Outcome of a maintenance scan.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Chunks whose bytes no longer match their recorded checksum; removed
    /// from disk and from the index, and owed a corruption report upstream.
    pub corrupted: Vec<String>,
    /// Index entries whose data file had vanished.
    pub missing: Vec<String>,
}

/// Content store for one chunk server instance.
///
/// Layout under `base_dir`: one data file per chunk named by its id, a
/// `{chunk_id}.meta` JSON sidecar, and a `checksums.json` summary index used
/// for fast startup. The sidecar is authoritative when the two disagree.
///
/// Writes go through a temp file and are renamed into place; a per-id
/// in-flight set keeps a master-directed deletion from racing an active write
/// to the same id.
pub struct ChunkStore {
    base_dir: PathBuf,
    index: RwLock<StoreIndex>,
    writing: Mutex<HashSet<String>>,
}

impl ChunkStore {
    pub async fn open(base_dir: impl Into<PathBuf>) -> DfsResult<Self> {
        let base_dir = base_dir.into();
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).await.map_err(|e| {
                warn!("chunk store: create base dir failed: {}", e);
                DfsError::Fatal(format!("create {}: {}", base_dir.to_string_lossy(), e))
            })?;
        }

        let store = Self {
            base_dir,
            index: RwLock::new(StoreIndex::default()),
            writing: Mutex::new(HashSet::new()),
        };
        store.load_index().await?;
        info!(
            "chunk store ready at {} ({} chunks)",
            store.base_dir.to_string_lossy(),
            store.chunk_count().await
        );
        Ok(store)
    }

    fn data_path(&self, chunk_id: &str) -> PathBuf {
        self.base_dir.join(chunk_id)
    }

    fn sidecar_path(&self, chunk_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{}", chunk_id, SIDECAR_EXT))
    }

    fn tmp_path(&self, chunk_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{}", chunk_id, TMP_EXT))
    }

    fn index_path(&self) -> PathBuf {
        self.base_dir.join(CHECKSUM_INDEX_FILE)
    }

    /// Store `data` under `chunk_id`, returning the stored checksum. When
    /// `expected_checksum` is given the data is verified *before* anything
    /// touches the disk. Rewriting an existing id is allowed (replication
    /// instructions are idempotent).
    pub async fn write_chunk(
        &self,
        chunk_id: &str,
        data: &[u8],
        expected_checksum: Option<&str>,
        is_encrypted: bool,
        is_erasure_coded: bool,
    ) -> DfsResult<String> {
        validate_chunk_id(chunk_id)?;

        let checksum = sha256_hex(data);
        if let Some(expected) = expected_checksum {
            if expected != checksum {
                warn!(
                    "chunk {}: checksum mismatch before write (expected {}, got {})",
                    chunk_id, expected, checksum
                );
                return Err(DfsError::IntegrityFailure(format!(
                    "chunk {} rejected: checksum mismatch",
                    chunk_id
                )));
            }
        }

        self.begin_write(chunk_id)?;
        let result = self
            .write_chunk_inner(chunk_id, data, &checksum, is_encrypted, is_erasure_coded)
            .await;
        self.end_write(chunk_id);

        if result.is_err() {
            // Leave no partial state behind.
            let _ = fs::remove_file(self.tmp_path(chunk_id)).await;
        }
        result?;

        debug!("wrote chunk {} ({} bytes)", chunk_id, data.len());
        Ok(checksum)
    }

    async fn write_chunk_inner(
        &self,
        chunk_id: &str,
        data: &[u8],
        checksum: &str,
        is_encrypted: bool,
        is_erasure_coded: bool,
    ) -> DfsResult<()> {
        let tmp_path = self.tmp_path(chunk_id);

        let file = fs::File::create(&tmp_path).await.map_err(|e| {
            warn!("chunk {}: create tmp failed: {}", chunk_id, e);
            DfsError::Transient(format!("create {}: {}", tmp_path.to_string_lossy(), e))
        })?;
        let std_file = file.into_std().await;
        std_file.try_lock_exclusive().map_err(|e| {
            warn!("chunk {}: lock tmp failed: {}", chunk_id, e);
            DfsError::Transient(format!("lock {}: {}", tmp_path.to_string_lossy(), e))
        })?;
        let mut file = fs::File::from_std(std_file);

        file.write_all(data).await.map_err(|e| {
            warn!("chunk {}: write failed: {}", chunk_id, e);
            DfsError::Transient(e.to_string())
        })?;
        file.sync_all().await.map_err(|e| {
            warn!("chunk {}: sync failed: {}", chunk_id, e);
            DfsError::Transient(e.to_string())
        })?;
        drop(file);

        fs::rename(&tmp_path, self.data_path(chunk_id))
            .await
            .map_err(|e| {
                warn!("chunk {}: rename failed: {}", chunk_id, e);
                DfsError::Transient(e.to_string())
            })?;

        let sidecar = ChunkSidecar {
            chunk_id: chunk_id.to_string(),
            checksum: checksum.to_string(),
            is_encrypted,
            is_erasure_coded,
            created_time: now_ms(),
        };
        self.save_sidecar(&sidecar).await?;

        let mut index = self.index.write().await;
        index
            .checksums
            .insert(chunk_id.to_string(), checksum.to_string());
        index.last_accessed.insert(chunk_id.to_string(), now_ms());
        Ok(())
    }

    /// Read a chunk back. With `verify` set, corrupt bytes are never
    /// returned: the checksum is recomputed and a mismatch surfaces as
    /// `IntegrityFailure`.
    pub async fn read_chunk(&self, chunk_id: &str, verify: bool) -> DfsResult<Vec<u8>> {
        validate_chunk_id(chunk_id)?;

        let expected = {
            let index = self.index.read().await;
            index.checksums.get(chunk_id).cloned()
        }
        .ok_or_else(|| DfsError::NotFound(format!("chunk {} not stored", chunk_id)))?;

        let data = fs::read(self.data_path(chunk_id)).await.map_err(|e| {
            warn!("chunk {}: read failed: {}", chunk_id, e);
            DfsError::from(e)
        })?;

        if verify {
            let actual = sha256_hex(&data);
            if actual != expected {
                warn!(
                    "chunk {}: integrity failure on read (expected {}, got {})",
                    chunk_id, expected, actual
                );
                return Err(DfsError::IntegrityFailure(format!(
                    "chunk {} failed integrity verification",
                    chunk_id
                )));
            }
        }

        let mut index = self.index.write().await;
        index.last_accessed.insert(chunk_id.to_string(), now_ms());
        Ok(data)
    }

    /// Recompute a chunk's checksum against the recorded one.
    pub async fn check_integrity(&self, chunk_id: &str) -> DfsResult<(bool, String)> {
        validate_chunk_id(chunk_id)?;

        let expected = {
            let index = self.index.read().await;
            index.checksums.get(chunk_id).cloned()
        }
        .ok_or_else(|| DfsError::NotFound(format!("chunk {} not stored", chunk_id)))?;

        let data = match fs::read(self.data_path(chunk_id)).await {
            Ok(data) => data,
            Err(e) => {
                warn!("chunk {}: integrity read failed: {}", chunk_id, e);
                return Ok((false, expected));
            }
        };
        let actual = sha256_hex(&data);
        Ok((actual == expected, expected))
    }

    /// Remove a chunk's data file, sidecar, and index entry. Deleting an id
    /// with a write in flight is refused as `Transient` so the master can
    /// re-issue the deletion later.
    pub async fn delete_chunk(&self, chunk_id: &str) -> DfsResult<()> {
        validate_chunk_id(chunk_id)?;

        {
            let writing = self.writing.lock().unwrap();
            if writing.contains(chunk_id) {
                return Err(DfsError::Transient(format!(
                    "chunk {} has a write in flight",
                    chunk_id
                )));
            }
        }

        if !self.chunk_exists(chunk_id).await {
            return Err(DfsError::NotFound(format!("chunk {} not stored", chunk_id)));
        }

        // Files first: a failed unlink leaves the index entry behind so the
        // deletion can be retried.
        for path in [self.data_path(chunk_id), self.sidecar_path(chunk_id)] {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("chunk {}: remove {} failed: {}", chunk_id, path.to_string_lossy(), e);
                    return Err(DfsError::Transient(e.to_string()));
                }
            }
        }

        let mut index = self.index.write().await;
        index.checksums.remove(chunk_id);
        index.last_accessed.remove(chunk_id);
        drop(index);
        debug!("deleted chunk {}", chunk_id);
        Ok(())
    }

    pub async fn chunk_exists(&self, chunk_id: &str) -> bool {
        let index = self.index.read().await;
        index.checksums.contains_key(chunk_id)
    }

    pub async fn chunk_checksum(&self, chunk_id: &str) -> Option<String> {
        let index = self.index.read().await;
        index.checksums.get(chunk_id).cloned()
    }

    pub async fn all_chunk_ids(&self) -> Vec<String> {
        let index = self.index.read().await;
        index.checksums.keys().cloned().collect()
    }

    pub async fn chunk_count(&self) -> u64 {
        let index = self.index.read().await;
        index.checksums.len() as u64
    }

    pub async fn total_storage_used(&self) -> u64 {
        let ids = self.all_chunk_ids().await;
        let mut total = 0u64;
        for id in ids {
            if let Ok(meta) = fs::metadata(self.data_path(&id)).await {
                total += meta.len();
            }
        }
        total
    }

    pub fn free_space(&self) -> u64 {
        fs2::available_space(&self.base_dir).unwrap_or(0)
    }

    pub fn total_space(&self) -> u64 {
        fs2::total_space(&self.base_dir).unwrap_or(0)
    }

    /// Maintenance pass: recompute every chunk's checksum, purge corrupt and
    /// missing entries, rewrite the summary index. Returns what was purged so
    /// the daemon can report corruption upstream.
    pub async fn scan(&self) -> DfsResult<ScanReport> {
        let ids = self.all_chunk_ids().await;
        let mut report = ScanReport::default();

        for chunk_id in ids {
            let expected = match self.chunk_checksum(&chunk_id).await {
                Some(c) => c,
                None => continue, // deleted mid-scan
            };
            match fs::read(self.data_path(&chunk_id)).await {
                Ok(data) => {
                    if sha256_hex(&data) != expected {
                        warn!("scan: chunk {} is corrupt, purging", chunk_id);
                        report.corrupted.push(chunk_id.clone());
                        self.purge(&chunk_id).await;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("scan: chunk {} data file missing, dropping", chunk_id);
                    report.missing.push(chunk_id.clone());
                    self.purge(&chunk_id).await;
                }
                Err(e) => {
                    warn!("scan: chunk {} unreadable: {}", chunk_id, e);
                }
            }
        }

        self.save_index().await?;
        info!(
            "maintenance scan done: {} corrupt, {} missing",
            report.corrupted.len(),
            report.missing.len()
        );
        Ok(report)
    }

    /// Persist the `chunk_id -> checksum` summary index.
    pub async fn save_index(&self) -> DfsResult<()> {
        let json = {
            let index = self.index.read().await;
            serde_json::to_vec_pretty(&index.checksums)
                .map_err(|e| DfsError::Fatal(format!("serialize checksum index: {}", e)))?
        };
        fs::write(self.index_path(), json).await.map_err(|e| {
            warn!("checksum index write failed: {}", e);
            DfsError::Transient(e.to_string())
        })
    }

    async fn load_index(&self) -> DfsResult<()> {
        let mut checksums: HashMap<String, String> = match fs::read(self.index_path()).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!("checksum index unreadable ({}), rebuilding from sidecars", e);
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no checksum index, starting fresh");
                HashMap::new()
            }
            Err(e) => return Err(DfsError::Fatal(format!("read checksum index: {}", e))),
        };

        // Reconcile with sidecars; the sidecar wins on mismatch. Entries
        // whose data file is gone are dropped.
        let mut dir = fs::read_dir(&self.base_dir).await.map_err(|e| {
            DfsError::Fatal(format!("scan {}: {}", self.base_dir.to_string_lossy(), e))
        })?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| DfsError::Fatal(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(chunk_id) = name.strip_suffix(&format!(".{}", SIDECAR_EXT)) else {
                continue;
            };
            match self.load_sidecar(chunk_id).await {
                Ok(sidecar) => {
                    let stale = checksums
                        .get(chunk_id)
                        .map(|c| c != &sidecar.checksum)
                        .unwrap_or(true);
                    if stale {
                        checksums.insert(chunk_id.to_string(), sidecar.checksum);
                    }
                }
                Err(e) => warn!("sidecar for {} unreadable: {}", chunk_id, e),
            }
        }

        let mut kept = HashMap::new();
        for (chunk_id, checksum) in checksums {
            if Path::new(&self.data_path(&chunk_id)).exists() {
                kept.insert(chunk_id, checksum);
            } else {
                warn!("chunk {} in index but missing on disk, dropped", chunk_id);
            }
        }

        let mut index = self.index.write().await;
        index.checksums = kept;
        Ok(())
    }

    async fn save_sidecar(&self, sidecar: &ChunkSidecar) -> DfsResult<()> {
        let json = serde_json::to_vec_pretty(sidecar)
            .map_err(|e| DfsError::Fatal(format!("serialize sidecar: {}", e)))?;
        fs::write(self.sidecar_path(&sidecar.chunk_id), json)
            .await
            .map_err(|e| {
                warn!("sidecar write for {} failed: {}", sidecar.chunk_id, e);
                DfsError::Transient(e.to_string())
            })
    }

    pub async fn load_sidecar(&self, chunk_id: &str) -> DfsResult<ChunkSidecar> {
        let raw = fs::read(self.sidecar_path(chunk_id)).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| DfsError::IntegrityFailure(format!("sidecar for {}: {}", chunk_id, e)))
    }

    async fn purge(&self, chunk_id: &str) {
        let mut index = self.index.write().await;
        index.checksums.remove(chunk_id);
        index.last_accessed.remove(chunk_id);
        drop(index);
        let _ = fs::remove_file(self.data_path(chunk_id)).await;
        let _ = fs::remove_file(self.sidecar_path(chunk_id)).await;
    }

    fn begin_write(&self, chunk_id: &str) -> DfsResult<()> {
        let mut writing = self.writing.lock().unwrap();
        if !writing.insert(chunk_id.to_string()) {
            return Err(DfsError::Transient(format!(
                "chunk {} already has a write in flight",
                chunk_id
            )));
        }
        Ok(())
    }

    fn end_write(&self, chunk_id: &str) {
        let mut writing = self.writing.lock().unwrap();
        writing.remove(chunk_id);
    }
}
