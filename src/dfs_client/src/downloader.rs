use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;

use dfs_lib::{
    decrypt, sha256_hex, ChunkClient, ChunkInfo, CodeGroup, CodeGroupCodec, CodedBlock, Config,
    DfsError, DfsResult, FileInfo, KeyManager, MasterClient, IV_SIZE, TAG_SIZE,
};

use crate::{ChunkCache, ProgressCallback};

/// Inverts the upload pipeline: fetch, verify, decode, decrypt, reassemble.
pub struct Downloader {
    master: MasterClient,
    chunks: ChunkClient,
    keys: Arc<KeyManager>,
    cache: Arc<ChunkCache>,
    config: Arc<Config>,
    progress: Option<ProgressCallback>,
}

impl Downloader {
    pub fn new(
        master: MasterClient,
        chunks: ChunkClient,
        keys: Arc<KeyManager>,
        cache: Arc<ChunkCache>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            master,
            chunks,
            keys,
            cache,
            config,
            progress: None,
        }
    }

    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress = Some(callback);
    }

    pub async fn download_file(&self, remote_path: &str, local_path: &Path) -> DfsResult<()> {
        info!(
            "downloading {} -> {}",
            remote_path,
            local_path.to_string_lossy()
        );

        let info = self.master.get_file_info(remote_path).await?;
        if !info.success {
            return Err(DfsError::from_message(info.message));
        }
        let file = info
            .file
            .ok_or_else(|| DfsError::NotFound(format!("file not found: {}", remote_path)))?;

        // Without the key there is no point touching the network.
        let key = if file.is_encrypted {
            Some(self.keys.get_key(&file.encryption_key_id).ok_or_else(|| {
                DfsError::NotFound(format!(
                    "decryption key {} is not in the local key store",
                    file.encryption_key_id
                ))
            })?)
        } else {
            None
        };

        let data = if file.is_erasure_coded {
            self.download_erasure_coded(&file, key.as_deref()).await?
        } else {
            self.download_replicated(&file, key.as_deref()).await?
        };

        tokio::fs::write(local_path, &data).await.map_err(|e| {
            DfsError::Transient(format!("write {}: {}", local_path.to_string_lossy(), e))
        })?;
        info!("download of {} completed ({} bytes)", remote_path, data.len());
        Ok(())
    }

    async fn download_replicated(
        &self,
        file: &FileInfo,
        key: Option<&str>,
    ) -> DfsResult<Vec<u8>> {
        let mut assembled = Vec::with_capacity(file.size as usize);
        let mut current_bytes = 0u64;

        for chunk in &file.chunks {
            let payload = self.fetch_chunk(chunk).await?;
            let plain = match key {
                Some(key) => decrypt(&payload, key)?,
                None => payload,
            };
            current_bytes += plain.len() as u64;
            assembled.extend_from_slice(&plain);
            if let Some(progress) = &self.progress {
                progress(current_bytes, file.size);
            }
        }
        Ok(assembled)
    }

    async fn download_erasure_coded(
        &self,
        file: &FileInfo,
        key: Option<&str>,
    ) -> DfsResult<Vec<u8>> {
        let (k, m) = (file.ec_data_blocks, file.ec_parity_blocks);
        if k == 0 || file.chunks.len() % (k + m) != 0 {
            return Err(DfsError::InvalidArgument(format!(
                "malformed erasure layout: {} blocks for k={}, m={}",
                file.chunks.len(),
                k,
                m
            )));
        }
        let codec = CodeGroupCodec::new(k, m)?;
        let chunk_size = self.config.chunk_size;
        let groups = file.chunks.len() / (k + m);

        let mut assembled = Vec::with_capacity(file.size as usize);
        let mut current_bytes = 0u64;

        for group_index in 0..groups {
            let slice_len =
                (file.size - group_index as u64 * chunk_size).min(chunk_size);
            // The codec ran over the post-encryption slice.
            let coded_len = match key {
                Some(_) => slice_len + (IV_SIZE + TAG_SIZE) as u64,
                None => slice_len,
            };

            let members = &file.chunks[group_index * (k + m)..(group_index + 1) * (k + m)];
            let group_id = members[0]
                .chunk_id
                .rsplit_once("_block_")
                .map(|(prefix, _)| prefix.to_string())
                .unwrap_or_default();

            let mut blocks: Vec<CodedBlock> = Vec::with_capacity(k);
            for (offset, chunk) in members.iter().enumerate() {
                if blocks.len() >= k {
                    break;
                }
                match self.fetch_chunk(chunk).await {
                    Ok(data) => blocks.push(CodedBlock {
                        chunk_id: chunk.chunk_id.clone(),
                        block_index: offset,
                        is_parity: offset >= k,
                        checksum: sha256_hex(&data),
                        data,
                    }),
                    Err(e) => warn!(
                        "block {} of group {} unavailable: {}",
                        chunk.chunk_id, group_id, e
                    ),
                }
            }
            if blocks.len() < k {
                return Err(DfsError::IntegrityFailure(format!(
                    "group {}: only {} of {} required blocks available",
                    group_id,
                    blocks.len(),
                    k
                )));
            }

            let group = CodeGroup {
                group_id,
                data_blocks: k,
                parity_blocks: m,
                original_size: coded_len,
                blocks,
            };
            let payload = codec.decode_group(&group)?;
            let plain = match key {
                Some(key) => decrypt(&payload, key)?,
                None => payload,
            };
            current_bytes += plain.len() as u64;
            assembled.extend_from_slice(&plain);
            if let Some(progress) = &self.progress {
                progress(current_bytes, file.size);
            }
        }
        Ok(assembled)
    }

    /// Cache, then each advertised location in order. Every body is verified
    /// against its SHA-256 before it is accepted; a bad replica just means we
    /// try the next one.
    async fn fetch_chunk(&self, chunk: &ChunkInfo) -> DfsResult<Vec<u8>> {
        if let Some(data) = self.cache.get(&chunk.chunk_id) {
            debug!("cache hit for {}", chunk.chunk_id);
            return Ok(data);
        }

        let mut last_err: Option<DfsError> = None;
        for address in &chunk.server_addresses {
            match self
                .chunks
                .read_chunk(address, &chunk.chunk_id, true)
                .await
            {
                Ok(data) => {
                    self.cache.put(&chunk.chunk_id, data.clone());
                    return Ok(data);
                }
                Err(e) => {
                    warn!(
                        "chunk {} from {} failed: {}, trying next replica",
                        chunk.chunk_id, address, e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            DfsError::Unavailable(format!(
                "chunk {} has no advertised locations",
                chunk.chunk_id
            ))
        }))
    }
}
