//! Presigned URL generation for S3-compatible requests.
//!
//! Uses AWS Signature Version 4 with the signature carried in the query
//! string, path-style addressing and `UNSIGNED-PAYLOAD`. Besides object URLs
//! the builder produces bucket-level URLs (no key), which the storage client
//! uses for HEAD/PUT bucket.

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum expiration accepted by S3 (7 days).
const MAX_EXPIRES_SECONDS: u64 = 604_800;

const DEFAULT_EXPIRES_SECONDS: u64 = 600;
const DEFAULT_REGION: &str = "us-east-1";
const SERVICE: &str = "s3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Put,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Head => "HEAD",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresignError {
    #[error("access key is required")]
    MissingAccessKey,
    #[error("secret key is required")]
    MissingSecretKey,
    #[error("bucket name is invalid")]
    InvalidBucket,
    #[error("endpoint URL is invalid")]
    InvalidEndpoint,
    #[error("signing key rejected")]
    InvalidSigningKey,
}

pub struct PresignedUrlBuilder {
    endpoint: String,
    bucket: String,
    key: Option<String>,
    method: HttpMethod,
    expires_seconds: u64,
    access_key: String,
    secret_key: String,
    region: String,
    query: BTreeMap<String, String>,
    timestamp: Option<DateTime<Utc>>,
}

impl PresignedUrlBuilder {
    /// A URL addressing `bucket` itself.
    pub fn bucket(endpoint: &str, bucket: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            key: None,
            method: HttpMethod::Get,
            expires_seconds: DEFAULT_EXPIRES_SECONDS,
            access_key: String::new(),
            secret_key: String::new(),
            region: DEFAULT_REGION.to_string(),
            query: BTreeMap::new(),
            timestamp: None,
        }
    }

    /// A URL addressing object `key` in `bucket`.
    pub fn object(endpoint: &str, bucket: &str, key: &str) -> Self {
        let mut builder = Self::bucket(endpoint, bucket);
        builder.key = Some(key.trim_start_matches('/').to_string());
        builder
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Capped at 7 days.
    pub fn expires_in_seconds(mut self, seconds: u64) -> Self {
        self.expires_seconds = seconds.min(MAX_EXPIRES_SECONDS);
        self
    }

    pub fn credentials(mut self, access_key: &str, secret_key: &str) -> Self {
        self.access_key = access_key.to_string();
        self.secret_key = secret_key.to_string();
        self
    }

    pub fn region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    /// An extra signed query parameter, such as `response-content-type`.
    pub fn query_param(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    /// Sign as of `ts` instead of now.
    pub fn timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn build(self) -> Result<String, PresignError> {
        if self.access_key.is_empty() {
            return Err(PresignError::MissingAccessKey);
        }
        if self.secret_key.is_empty() {
            return Err(PresignError::MissingSecretKey);
        }
        if self.bucket.is_empty() || self.bucket.contains('/') {
            return Err(PresignError::InvalidBucket);
        }
        let host = extract_host(&self.endpoint)?;

        let now = self.timestamp.unwrap_or_else(Utc::now);
        let date = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential_scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);

        let canonical_uri = match &self.key {
            Some(key) => uri_encode_path(&format!("/{}/{key}", self.bucket)),
            None => uri_encode_path(&format!("/{}", self.bucket)),
        };

        let mut params = self.query.clone();
        params.insert("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string());
        params.insert(
            "X-Amz-Credential".to_string(),
            format!("{}/{credential_scope}", self.access_key),
        );
        params.insert("X-Amz-Date".to_string(), amz_date.clone());
        params.insert("X-Amz-Expires".to_string(), self.expires_seconds.to_string());
        params.insert("X-Amz-SignedHeaders".to_string(), "host".to_string());
        let canonical_query = canonical_query_string(&params);

        let canonical_request = format!(
            "{}\n{canonical_uri}\n{canonical_query}\nhost:{host}\n\nhost\nUNSIGNED-PAYLOAD",
            self.method.as_str()
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );
        let signature = signature(
            &self.secret_key,
            &date,
            &self.region,
            &string_to_sign,
        )?;

        Ok(format!(
            "{}{canonical_uri}?{canonical_query}&X-Amz-Signature={signature}",
            self.endpoint
        ))
    }
}

/// Percent-encode everything but unreserved characters and `/`.
fn uri_encode_path(path: &str) -> String {
    encode(path, true)
}

fn uri_encode_value(value: &str) -> String {
    encode(value, false)
}

fn encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

fn canonical_query_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode_value(k), uri_encode_value(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, PresignError> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).map_err(|_| PresignError::InvalidSigningKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signature(
    secret_key: &str,
    date: &str,
    region: &str,
    string_to_sign: &str,
) -> Result<String, PresignError> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    Ok(hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?))
}

fn extract_host(endpoint: &str) -> Result<String, PresignError> {
    let rest = endpoint
        .strip_prefix("http://")
        .or_else(|| endpoint.strip_prefix("https://"))
        .ok_or(PresignError::InvalidEndpoint)?;
    let host = rest.split('/').next().unwrap_or(rest);
    if host.is_empty() {
        return Err(PresignError::InvalidEndpoint);
    }
    Ok(host.to_string())
}
