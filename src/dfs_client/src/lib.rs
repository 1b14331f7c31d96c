mod cache;
mod client;
mod downloader;
mod uploader;

pub use cache::*;
pub use client::*;
pub use downloader::*;
pub use uploader::*;

/// Invoked after each completed chunk with `(current_bytes, total_bytes)`.
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;
