//! Object storage collaborator.
//!
//! The report producer only sees `ObjectStore`: ensure a bucket, put an
//! object, presign a download link. `S3ObjectStore` talks to an
//! S3-compatible service (MinIO in development) with SigV4 query-signed
//! requests; `MemoryObjectStore` keeps objects in memory.

pub mod memory;
pub mod presign;
pub mod s3;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryObjectStore;
pub use presign::{HttpMethod, PresignError, PresignedUrlBuilder};
pub use s3::S3ObjectStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Request(String),

    #[error("{operation} returned HTTP {status}")]
    Status { operation: &'static str, status: u16 },

    #[error("could not presign request: {0}")]
    Presign(#[from] PresignError),
}

#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError>;

    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// A time-limited GET link. `response_headers` become signed
    /// `response-*` overrides, e.g. `content-type`.
    async fn presigned_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        response_headers: &BTreeMap<String, String>,
    ) -> Result<String, StorageError>;
}

#[cfg(test)]
mod tests;
