use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use super::presign::{HttpMethod, PresignedUrlBuilder};
use super::{ObjectStore, StorageError};
use crate::config::StorageSettings;

/// Lifetime of the URLs the client signs for its own requests.
const REQUEST_EXPIRES_SECONDS: u64 = 300;

/// Client for an S3-compatible service using path-style, query-signed requests.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: reqwest::Client,
    endpoint: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3ObjectStore {
    pub fn new(settings: &StorageSettings) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StorageError::Request(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            region: settings.region.clone(),
            access_key: settings.access_key.clone(),
            secret_key: settings.secret_key.clone(),
        })
    }

    fn sign(&self, builder: PresignedUrlBuilder) -> Result<String, StorageError> {
        Ok(builder
            .credentials(&self.access_key, &self.secret_key)
            .region(&self.region)
            .build()?)
    }

    fn bucket_url(&self, bucket: &str, method: HttpMethod) -> Result<String, StorageError> {
        self.sign(
            PresignedUrlBuilder::bucket(&self.endpoint, bucket)
                .method(method)
                .expires_in_seconds(REQUEST_EXPIRES_SECONDS),
        )
    }
}

impl fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        let url = self.bucket_url(bucket, HttpMethod::Head)?;
        let response = self.client.head(url).send().await.map_err(request_error)?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(StorageError::Status {
                operation: "HEAD bucket",
                status: status.as_u16(),
            }),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let url = self.bucket_url(bucket, HttpMethod::Put)?;
        let response = self.client.put(url).send().await.map_err(request_error)?;
        match response.status() {
            status if status.is_success() => {
                debug!(bucket, "bucket created");
                Ok(())
            }
            // Already owned by us: another worker won the race.
            StatusCode::CONFLICT => Ok(()),
            status => Err(StorageError::Status {
                operation: "PUT bucket",
                status: status.as_u16(),
            }),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let url = self.sign(
            PresignedUrlBuilder::object(&self.endpoint, bucket, key)
                .method(HttpMethod::Put)
                .expires_in_seconds(REQUEST_EXPIRES_SECONDS),
        )?;
        let size = bytes.len();
        let response = self
            .client
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(StorageError::Status {
                operation: "PUT object",
                status: response.status().as_u16(),
            });
        }
        debug!(bucket, key, size, "object stored");
        Ok(())
    }

    async fn presigned_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        response_headers: &BTreeMap<String, String>,
    ) -> Result<String, StorageError> {
        let mut builder = PresignedUrlBuilder::object(&self.endpoint, bucket, key)
            .method(HttpMethod::Get)
            .expires_in_seconds(ttl.as_secs());
        for (name, value) in response_headers {
            builder = builder.query_param(&format!("response-{name}"), value);
        }
        self.sign(builder)
    }
}

fn request_error(error: reqwest::Error) -> StorageError {
    StorageError::Request(error.to_string())
}
