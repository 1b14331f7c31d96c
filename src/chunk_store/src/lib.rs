mod local_store;

pub use local_store::*;

#[cfg(test)]
mod store_tests;
