//! Upstream statistics sources.
//!
//! The HTTP APIs are treated as opaque JSON sources with an assumed schema.
//!
//! - [`endpoints`]: the fixed endpoint set and per-endpoint retry policies
//! - [`fetcher`]: HTTP retrieval, archival of raw documents, archival worker pool
//! - [`schema`]: typed record shapes and record extraction

pub mod endpoints;
pub mod fetcher;
pub mod schema;

pub use endpoints::{EndpointId, EndpointRegistry, RetryPolicy};
pub use fetcher::{ArchivalPool, Archive, SnapshotFetcher};
