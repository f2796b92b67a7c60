//! Durable store backends + HTTP fetch utilities for jobfeed.

pub mod http;
pub mod memory;
pub mod pg;
pub mod store;

pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, TokenBucketConfig,
};
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use store::{JobStore, OrganizationStore, RunStatusStore, StoreError};

pub const CRATE_NAME: &str = "jobfeed-storage";
