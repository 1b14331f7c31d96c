mod chunk_client;
mod config;
mod crypto;
mod erasure;
mod error;
mod hash;
mod master_client;
mod protocol;
mod types;

pub use chunk_client::*;
pub use config::*;
pub use crypto::*;
pub use erasure::*;
pub use error::*;
pub use hash::*;
pub use master_client::*;
pub use protocol::*;
pub use types::*;

/// Fixed split size for file chunks. The last chunk of a file may be shorter.
pub const CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Upper bound for a single RPC payload, request or response.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

pub const DEFAULT_REPLICATION_FACTOR: usize = 3;
pub const DEFAULT_EC_DATA_BLOCKS: usize = 4;
pub const DEFAULT_EC_PARITY_BLOCKS: usize = 2;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 15_000;

/// Minimum fraction of a server's total space that must remain free after a
/// placement.
pub const MIN_FREE_SPACE_FRACTION: f64 = 0.10;
