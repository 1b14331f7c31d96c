use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;

use dfs_lib::{
    encrypt, group_id_for, sha256_hex, AllocateChunksRequest, ChunkClient, ChunkInfo,
    CodeGroupCodec, CompleteUploadRequest, Config, CreateFileRequest, DfsError, DfsResult,
    KeyManager, MasterClient,
};

use crate::{ChunkCache, ProgressCallback};

/// Drives the write pipeline: split, encrypt, erasure-code, fan out to chunk
/// servers, seal.
///
/// Replica policy: a chunk write succeeds once at least one of its placement
/// targets acknowledges. Shortfalls are logged and left to the master's
/// repair sweep to top back up to `R`.
pub struct Uploader {
    master: MasterClient,
    chunks: ChunkClient,
    keys: Arc<KeyManager>,
    cache: Arc<ChunkCache>,
    config: Arc<Config>,
    progress: Option<ProgressCallback>,
}

impl Uploader {
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

    pub async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        enable_encryption: bool,
        enable_erasure_coding: bool,
    ) -> DfsResult<()> {
        info!(
            "uploading {} -> {}",
            local_path.to_string_lossy(),
            remote_path
        );
        let data = tokio::fs::read(local_path).await.map_err(|e| {
            DfsError::NotFound(format!("{}: {}", local_path.to_string_lossy(), e))
        })?;
        let total_bytes = data.len() as u64;

        let create = self
            .master
            .create_file(&CreateFileRequest {
                filename: remote_path.to_string(),
                file_size: total_bytes,
                enable_encryption,
                enable_erasure_coding,
            })
            .await?;
        if !create.success {
            return Err(DfsError::from_message(create.message));
        }
        let file_id = create.file_id;

        let key = if enable_encryption {
            let key = create.encryption_key.ok_or_else(|| {
                DfsError::Fatal("master did not return an encryption key".to_string())
            })?;
            self.keys.store_key(&create.encryption_key_id, &key);
            Some(key)
        } else {
            None
        };

        match self
            .upload_chunks(
                &file_id,
                remote_path,
                &data,
                key.as_deref(),
                enable_erasure_coding,
            )
            .await
        {
            Ok(()) => {
                info!("upload of {} completed", remote_path);
                Ok(())
            }
            Err(e) => {
                // Leave no partial file behind; the master cascades chunk
                // deletion to the servers.
                warn!("upload of {} failed, deleting partial state", remote_path);
                if let Err(cleanup) = self.master.delete_file(remote_path).await {
                    warn!("cleanup of {} failed: {}", remote_path, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn upload_chunks(
        &self,
        file_id: &str,
        remote_path: &str,
        data: &[u8],
        key: Option<&str>,
        erasure_coded: bool,
    ) -> DfsResult<()> {
        let chunk_size = self.config.chunk_size as usize;
        let chunk_count = data.len().div_ceil(chunk_size);

        let alloc = self
            .master
            .allocate_chunks(&AllocateChunksRequest {
                file_id: file_id.to_string(),
                chunk_count,
                enable_erasure_coding: erasure_coded,
            })
            .await?;
        if !alloc.success {
            return Err(DfsError::from_message(alloc.message));
        }

        let uploaded = if erasure_coded {
            self.upload_erasure_coded(file_id, data, key, &alloc.allocated_chunks)
                .await?
        } else {
            self.upload_replicated(data, key, &alloc.allocated_chunks)
                .await?
        };

        let complete = self
            .master
            .complete_upload(&CompleteUploadRequest {
                file_id: file_id.to_string(),
                uploaded_chunk_ids: uploaded,
            })
            .await?;
        if !complete.success {
            return Err(DfsError::from_message(complete.message));
        }
        debug!("sealed {} ({} chunks)", remote_path, chunk_count);
        Ok(())
    }

    async fn upload_replicated(
        &self,
        data: &[u8],
        key: Option<&str>,
        allocated: &[ChunkInfo],
    ) -> DfsResult<Vec<String>> {
        let chunk_size = self.config.chunk_size as usize;
        let total_bytes = data.len() as u64;
        let mut uploaded = Vec::with_capacity(allocated.len());
        let mut current_bytes = 0u64;

        for (index, info) in allocated.iter().enumerate() {
            let start = index * chunk_size;
            let slice = &data[start..(start + chunk_size).min(data.len())];
            let payload = match key {
                Some(key) => encrypt(slice, key)?,
                None => slice.to_vec(),
            };

            self.write_to_replicas(&info.chunk_id, &payload, &info.server_addresses, key.is_some(), false)
                .await?;
            self.cache.put(&info.chunk_id, payload);
            uploaded.push(info.chunk_id.clone());

            current_bytes += slice.len() as u64;
            if let Some(progress) = &self.progress {
                progress(current_bytes, total_bytes);
            }
        }
        Ok(uploaded)
    }

    async fn upload_erasure_coded(
        &self,
        file_id: &str,
        data: &[u8],
        key: Option<&str>,
        allocated: &[ChunkInfo],
    ) -> DfsResult<Vec<String>> {
        let chunk_size = self.config.chunk_size as usize;
        let (k, m) = (self.config.ec_data_blocks, self.config.ec_parity_blocks);
        let codec = CodeGroupCodec::new(k, m)?;
        let groups = data.len().div_ceil(chunk_size);
        if allocated.len() != groups * (k + m) {
            return Err(DfsError::InvalidArgument(format!(
                "allocator returned {} blocks, expected {}",
                allocated.len(),
                groups * (k + m)
            )));
        }

        let total_bytes = data.len() as u64;
        let mut uploaded = Vec::with_capacity(allocated.len());
        let mut current_bytes = 0u64;

        for group_index in 0..groups {
            let start = group_index * chunk_size;
            let slice = &data[start..(start + chunk_size).min(data.len())];
            let payload = match key {
                Some(key) => encrypt(slice, key)?,
                None => slice.to_vec(),
            };

            let group_id = group_id_for(file_id, group_index);
            let group = codec.encode_group(&group_id, &payload)?;

            for block in &group.blocks {
                let info = &allocated[group_index * (k + m) + block.block_index];
                if info.chunk_id != block.chunk_id {
                    return Err(DfsError::InvalidArgument(format!(
                        "placement order mismatch: expected {}, allocator gave {}",
                        block.chunk_id, info.chunk_id
                    )));
                }
                self.write_to_replicas(
                    &block.chunk_id,
                    &block.data,
                    &info.server_addresses,
                    key.is_some(),
                    true,
                )
                .await?;
                uploaded.push(block.chunk_id.clone());
            }

            current_bytes += slice.len() as u64;
            if let Some(progress) = &self.progress {
                progress(current_bytes, total_bytes);
            }
        }
        Ok(uploaded)
    }

    /// Write one block to every placement address; at least one
    /// acknowledgement makes the block durable enough to proceed.
    async fn write_to_replicas(
        &self,
        chunk_id: &str,
        payload: &[u8],
        addresses: &[String],
        is_encrypted: bool,
        is_erasure_coded: bool,
    ) -> DfsResult<()> {
        if addresses.is_empty() {
            return Err(DfsError::Unavailable(format!(
                "no servers allocated for chunk {}",
                chunk_id
            )));
        }

        let checksum = sha256_hex(payload);
        let mut acks = 0usize;
        for address in addresses {
            match self
                .chunks
                .write_chunk(
                    address,
                    chunk_id,
                    payload.to_vec(),
                    &checksum,
                    is_encrypted,
                    is_erasure_coded,
                )
                .await
            {
                Ok(resp) if resp.success => {
                    debug!("chunk {} written to {}", chunk_id, address);
                    acks += 1;
                }
                Ok(resp) => warn!(
                    "chunk {} rejected by {}: {}",
                    chunk_id, address, resp.message
                ),
                Err(e) => warn!("chunk {} write to {} failed: {}", chunk_id, address, e),
            }
        }

        if acks == 0 {
            return Err(DfsError::Unavailable(format!(
                "chunk {} was not accepted by any of {} servers",
                chunk_id,
                addresses.len()
            )));
        }
        if acks < addresses.len() {
            warn!(
                "chunk {}: {}/{} replicas written, repair will top up",
                chunk_id,
                acks,
                addresses.len()
            );
        }
        Ok(())
    }
}
