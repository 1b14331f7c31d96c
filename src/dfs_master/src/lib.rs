mod allocator;
mod background;
mod meta;
mod service;

pub use allocator::*;
pub use background::*;
pub use meta::*;
pub use service::*;

#[cfg(test)]
mod allocator_tests;
#[cfg(test)]
mod meta_tests;

/// Files that never saw a `CompleteUpload` are swept after this long.
pub const UPLOAD_DEADLINE_MS: u64 = 60 * 60 * 1000;

/// Rebalance when the population std-dev of server loads exceeds this.
pub const LOAD_STDDEV_THRESHOLD: f64 = 0.30;
/// A server above this load sheds its least-recently-accessed chunks.
pub const OVERLOAD_THRESHOLD: f64 = 0.80;
/// A server below this load may receive rebalanced chunks.
pub const UNDERLOAD_THRESHOLD: f64 = 0.30;
