use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::pipeline::messages::{NotificationEvent, ReportJob};
use crate::report::content::{CsvReport, ReportContent};
use crate::storage::{ObjectStore, StorageError};

pub const REPORT_CONTENT_TYPE: &str = "application/octet-stream";
pub const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(600);

/// Builds a report for a job, stores it and returns the completion event.
#[derive(Debug, Clone)]
pub struct ReportProducer {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    ttl: Duration,
    content: Arc<dyn ReportContent>,
}

impl ReportProducer {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            ttl: DEFAULT_PRESIGN_TTL,
            content: Arc::new(CsvReport::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_content(mut self, content: Arc<dyn ReportContent>) -> Self {
        self.content = content;
        self
    }

    /// Ensure the bucket, upload under a fresh name, presign a download link.
    ///
    /// Every call uploads a new object; a redelivered job produces a second
    /// artifact rather than overwriting the first.
    pub async fn produce(&self, job: &ReportJob) -> Result<NotificationEvent, StorageError> {
        if !self.store.bucket_exists(&self.bucket).await? {
            info!(bucket = %self.bucket, "creating bucket");
            self.store.create_bucket(&self.bucket).await?;
        }

        let file_name = format!(
            "{}-{}.{}",
            job.user_id,
            Uuid::new_v4(),
            self.content.extension()
        );
        let bytes = self.content.render();
        let size = bytes.len();
        self.store
            .put_object(&self.bucket, &file_name, bytes, REPORT_CONTENT_TYPE)
            .await?;
        debug!(bucket = %self.bucket, key = %file_name, bytes = size, "report uploaded");

        let mut response_headers = BTreeMap::new();
        response_headers.insert("content-type".to_string(), REPORT_CONTENT_TYPE.to_string());
        let download_url = self
            .store
            .presigned_get(&self.bucket, &file_name, self.ttl, &response_headers)
            .await?;

        info!(user_id = %job.user_id, file_name = %file_name, "report ready");
        Ok(NotificationEvent {
            user_id: job.user_id,
            file_name,
            download_url,
        })
    }
}
