use log::warn;
use std::path::Path;

use crate::{
    DfsError, DfsResult, CHUNK_SIZE, DEFAULT_EC_DATA_BLOCKS, DEFAULT_EC_PARITY_BLOCKS,
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS, DEFAULT_REPLICATION_FACTOR,
};

/// Placement strategy used by the master's chunk allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    RoundRobin,
    LeastLoaded,
    Random,
    ZoneAware,
}

impl AllocationStrategy {
    pub fn parse(value: &str) -> DfsResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "round_robin" => Ok(AllocationStrategy::RoundRobin),
            "least_loaded" => Ok(AllocationStrategy::LeastLoaded),
            "random" => Ok(AllocationStrategy::Random),
            "zone_aware" => Ok(AllocationStrategy::ZoneAware),
            other => Err(DfsError::InvalidArgument(format!(
                "unknown allocation strategy: {}",
                other
            ))),
        }
    }
}

/// Process configuration, loaded from `key=value` lines (`#` comments).
#[derive(Debug, Clone)]
pub struct Config {
    pub replication_factor: usize,
    pub chunk_size: u64,
    pub data_directory: String,
    pub master_address: String,
    pub master_port: u16,
    pub encryption_enabled: bool,
    pub erasure_coding_enabled: bool,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub cache_size_mb: usize,
    pub ec_data_blocks: usize,
    pub ec_parity_blocks: usize,
    pub allocation_strategy: AllocationStrategy,
    pub zone: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            chunk_size: CHUNK_SIZE,
            data_directory: "./data".to_string(),
            master_address: "127.0.0.1".to_string(),
            master_port: 50051,
            encryption_enabled: true,
            erasure_coding_enabled: false,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            cache_size_mb: 100,
            ec_data_blocks: DEFAULT_EC_DATA_BLOCKS,
            ec_parity_blocks: DEFAULT_EC_PARITY_BLOCKS,
            allocation_strategy: AllocationStrategy::LeastLoaded,
            zone: "default".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> DfsResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DfsError::NotFound(format!(
                "config file {}: {}",
                path.as_ref().to_string_lossy(),
                e
            ))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> DfsResult<Self> {
        let mut config = Config::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                DfsError::InvalidArgument(format!("config line {}: missing '='", lineno + 1))
            })?;
            config.apply(key.trim(), value.trim(), lineno + 1)?;
        }
        Ok(config)
    }

    pub fn master_endpoint(&self) -> String {
        format!("{}:{}", self.master_address, self.master_port)
    }

    fn apply(&mut self, key: &str, value: &str, lineno: usize) -> DfsResult<()> {
        match key {
            "replication_factor" => {
                self.replication_factor = parse_number(key, value, lineno)?;
            }
            "chunk_size" => self.chunk_size = parse_number(key, value, lineno)?,
            "data_directory" => self.data_directory = value.to_string(),
            "master_address" => self.master_address = value.to_string(),
            "master_port" => self.master_port = parse_number(key, value, lineno)?,
            "encryption_enabled" => self.encryption_enabled = parse_bool(value, lineno)?,
            "erasure_coding_enabled" => self.erasure_coding_enabled = parse_bool(value, lineno)?,
            "heartbeat_interval_ms" => {
                self.heartbeat_interval_ms = parse_number(key, value, lineno)?;
            }
            "heartbeat_timeout_ms" => {
                self.heartbeat_timeout_ms = parse_number(key, value, lineno)?;
            }
            "cache_size_mb" => self.cache_size_mb = parse_number(key, value, lineno)?,
            "ec_data_blocks" => self.ec_data_blocks = parse_number(key, value, lineno)?,
            "ec_parity_blocks" => self.ec_parity_blocks = parse_number(key, value, lineno)?,
            "allocation_strategy" => {
                self.allocation_strategy = AllocationStrategy::parse(value)?;
            }
            "zone" => self.zone = value.to_string(),
            other => {
                warn!("config line {}: unknown key {}, ignored", lineno, other);
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str, lineno: usize) -> DfsResult<T>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| {
        DfsError::InvalidArgument(format!("config line {}: {}: {}", lineno, key, e))
    })
}

fn parse_bool(value: &str, lineno: usize) -> DfsResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(DfsError::InvalidArgument(format!(
            "config line {}: expected bool, got {}",
            lineno, other
        ))),
    }
}
