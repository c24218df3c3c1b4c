use std::collections::BTreeMap;
use std::time::Duration;

use super::{MemoryObjectStore, ObjectStore, S3ObjectStore, StorageError};
use crate::config::StorageSettings;

fn settings() -> StorageSettings {
    StorageSettings {
        endpoint: "http://localhost:9000".to_string(),
        access_key: "minio".to_string(),
        secret_key: "minio123".to_string(),
        bucket: "files".to_string(),
        region: "us-east-1".to_string(),
        presign_ttl_secs: 600,
    }
}

#[tokio::test]
async fn test_memory_store_put_requires_bucket() {
    let store = MemoryObjectStore::new();

    let err = store
        .put_object("files", "a.csv", b"x".to_vec(), "text/csv")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Status { status: 404, .. }));

    store.create_bucket("files").await.unwrap();
    assert!(store.bucket_exists("files").await.unwrap());
    store
        .put_object("files", "a.csv", b"x".to_vec(), "text/csv")
        .await
        .unwrap();
    assert_eq!(store.object("files", "a.csv").unwrap().content_type, "text/csv");
}

#[tokio::test]
async fn test_memory_store_failure_injection() {
    let store = MemoryObjectStore::new();
    store.set_failing(true);

    assert!(store.bucket_exists("files").await.is_err());

    store.set_failing(false);
    assert!(!store.bucket_exists("files").await.unwrap());
}

#[tokio::test]
async fn test_s3_presigned_get_carries_response_overrides() {
    let store = S3ObjectStore::new(&settings()).unwrap();
    let mut headers = BTreeMap::new();
    headers.insert(
        "content-type".to_string(),
        "application/octet-stream".to_string(),
    );

    let url = store
        .presigned_get("files", "u.csv", Duration::from_secs(600), &headers)
        .await
        .unwrap();

    assert!(url.starts_with("http://localhost:9000/files/u.csv?"));
    assert!(url.contains("X-Amz-Expires=600"));
    assert!(url.contains("response-content-type=application%2Foctet-stream"));
}

#[test]
fn test_s3_debug_hides_secret() {
    let store = S3ObjectStore::new(&settings()).unwrap();
    let rendered = format!("{store:?}");
    assert!(!rendered.contains("minio123"));
}

#[tokio::test]
#[ignore = "requires MinIO running"]
async fn test_s3_round_trip_against_minio() {
    let store = S3ObjectStore::new(&settings()).unwrap();
    if !store.bucket_exists("reportbus-it").await.unwrap() {
        store.create_bucket("reportbus-it").await.unwrap();
    }
    store
        .put_object("reportbus-it", "smoke.csv", b"a;b;".to_vec(), "application/octet-stream")
        .await
        .unwrap();
}
