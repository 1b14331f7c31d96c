use log::warn;
use std::path::Path;
use std::sync::Arc;

use dfs_lib::{
    ChunkClient, Config, DfsResult, FileInfo, KeyManager, MasterClient, StatsResponse,
};

use crate::{CacheStats, ChunkCache, Downloader, ProgressCallback, Uploader};

/// Default location of the optional encrypted key file.
pub const KEY_FILE: &str = "keys.dat";
/// Environment variable holding the key-file password. When unset, keys live
/// only for the lifetime of the process.
pub const KEY_PASSWORD_ENV: &str = "DFS_KEY_PASSWORD";

/// One client session: a master connection, a chunk cache, a key store, and
/// the upload/download pipelines built on top of them.
pub struct DfsClient {
    master: MasterClient,
    keys: Arc<KeyManager>,
    cache: Arc<ChunkCache>,
    config: Arc<Config>,
    uploader: Uploader,
    downloader: Downloader,
}

impl DfsClient {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let master = MasterClient::new(&config.master_endpoint());
        let chunks = ChunkClient::new();
        let keys = Arc::new(KeyManager::new());
        let cache = Arc::new(ChunkCache::new(config.cache_size_mb));

        if let Ok(password) = std::env::var(KEY_PASSWORD_ENV) {
            if Path::new(KEY_FILE).exists() {
                if let Err(e) = keys.load_from_file(KEY_FILE, &password) {
                    warn!("key file unusable: {}", e);
                }
            }
        }

        let uploader = Uploader::new(
            master.clone(),
            chunks.clone(),
            keys.clone(),
            cache.clone(),
            config.clone(),
        );
        let downloader = Downloader::new(
            master.clone(),
            chunks,
            keys.clone(),
            cache.clone(),
            config.clone(),
        );
        Self {
            master,
            keys,
            cache,
            config,
            uploader,
            downloader,
        }
    }

    pub fn set_upload_progress(&mut self, callback: ProgressCallback) {
        self.uploader.set_progress_callback(callback);
    }

    pub fn set_download_progress(&mut self, callback: ProgressCallback) {
        self.downloader.set_progress_callback(callback);
    }

    pub async fn put(
        &self,
        local: &Path,
        remote: &str,
        enable_encryption: bool,
        enable_erasure_coding: bool,
    ) -> DfsResult<()> {
        self.uploader
            .upload_file(local, remote, enable_encryption, enable_erasure_coding)
            .await?;
        self.persist_keys();
        Ok(())
    }

    pub async fn get(&self, remote: &str, local: &Path) -> DfsResult<()> {
        self.downloader.download_file(remote, local).await
    }

    pub async fn delete(&self, remote: &str) -> DfsResult<()> {
        let resp = self.master.delete_file(remote).await?;
        if !resp.success {
            return Err(dfs_lib::DfsError::from_message(resp.message));
        }
        Ok(())
    }

    pub async fn list(&self, prefix: &str) -> DfsResult<Vec<FileInfo>> {
        let resp = self.master.list_files(prefix).await?;
        if !resp.success {
            return Err(dfs_lib::DfsError::from_message(resp.message));
        }
        Ok(resp.files)
    }

    pub async fn info(&self, remote: &str) -> DfsResult<FileInfo> {
        let resp = self.master.get_file_info(remote).await?;
        if !resp.success {
            return Err(dfs_lib::DfsError::from_message(resp.message));
        }
        resp.file
            .ok_or_else(|| dfs_lib::DfsError::NotFound(format!("file not found: {}", remote)))
    }

    pub async fn cluster_stats(&self) -> DfsResult<StatsResponse> {
        self.master.stats().await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn set_cache_size_mb(&self, size_mb: usize) {
        self.cache.set_capacity_mb(size_mb);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Flush the key store to its encrypted file when a password is present.
    fn persist_keys(&self) {
        if self.keys.key_count() == 0 {
            return;
        }
        match std::env::var(KEY_PASSWORD_ENV) {
            Ok(password) => {
                if let Err(e) = self.keys.save_to_file(KEY_FILE, &password) {
                    warn!("saving key file failed: {}", e);
                }
            }
            Err(_) => warn!(
                "encryption keys held in memory only; set {} to persist them",
                KEY_PASSWORD_ENV
            ),
        }
    }
}
