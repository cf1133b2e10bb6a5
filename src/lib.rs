//! Shared fixtures for the workspace benches and end-to-end tests.

#[cfg(feature = "bench-include")]
pub mod bench_support;
