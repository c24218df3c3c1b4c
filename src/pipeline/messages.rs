use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request to build a report for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportJob {
    pub user_id: Uuid,
}

/// Published once a report is uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub user_id: Uuid,
    pub file_name: String,
    pub download_url: String,
}
