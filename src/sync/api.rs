//! Sync API Client - HTTP communication with the FHIR resource server
//!
//! Handles the REST calls the engine needs:
//! - Versioned create/update/delete (optimistic concurrency)
//! - Single-resource fetch (conflict capture)
//! - Change feed since a checkpoint (`_history`), paginated
//!
//! Version preconditions travel as headers: `If-None-Match: *` on create,
//! `If-Match: W/"<version>"` on update/delete. The server's version comes
//! back in `ETag`, falling back to `meta.versionId` in the body.

use super::models::{OperationKind, ResourceKey, SyncOperation};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const FHIR_JSON: &str = "application/fhir+json";

// ============================================================================
// Remote Server Contract
// ============================================================================

/// Server acknowledgement of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushAck {
    /// New server version; None when a delete returned no ETag
    pub version: Option<i64>,
}

/// One resource as the server currently has it
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResource {
    pub key: ResourceKey,
    pub version: i64,
    pub last_modified: DateTime<Utc>,
    pub deleted: bool,
    /// None for deletions
    pub resource: Option<Value>,
}

/// One page of the change feed, oldest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangePage {
    pub entries: Vec<RemoteResource>,
    /// Opaque cursor for the following page
    pub next: Option<String>,
}

/// Remote resource server as seen by the sync engine
#[async_trait]
pub trait RemoteServer: Send + Sync {
    /// Apply one operation; `resource` is the plaintext body for create/update
    async fn push(&self, op: &SyncOperation, resource: Option<&Value>) -> Result<PushAck, ApiError>;

    /// Current server copy, None if it does not exist
    async fn fetch(&self, key: &ResourceKey) -> Result<Option<RemoteResource>, ApiError>;

    /// Changes since `since`, or the page behind `cursor`
    async fn pull(
        &self,
        since: Option<DateTime<Utc>>,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<ChangePage, ApiError>;
}

// ============================================================================
// FHIR HTTP Client
// ============================================================================

/// reqwest-backed client for a FHIR R4 server
pub struct FhirApiClient {
    client: Client,
    base_url: String,
    /// Bearer token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl FhirApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        url::Url::parse(base_url).map_err(|e| ApiError::Client(format!("{}: {}", base_url, e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Set access token (after login)
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear token (logout)
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    fn resource_url(&self, key: &ResourceKey) -> String {
        format!("{}/{}/{}", self.base_url, key.resource_type, key.id)
    }

    async fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(reqwest::header::ACCEPT, FHIR_JSON);
        match self.get_token().await {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl RemoteServer for FhirApiClient {
    async fn push(&self, op: &SyncOperation, resource: Option<&Value>) -> Result<PushAck, ApiError> {
        let key = op.key();
        let url = self.resource_url(&key);

        let request = match op.operation {
            OperationKind::Create | OperationKind::Update => {
                let mut body = resource
                    .cloned()
                    .ok_or_else(|| ApiError::Client(format!("{} has no body to push", key)))?;
                if let Value::Object(map) = &mut body {
                    map.insert("resourceType".to_string(), Value::String(key.resource_type.clone()));
                    map.insert("id".to_string(), Value::String(key.id.clone()));
                }

                let builder = self
                    .client
                    .put(&url)
                    .header(reqwest::header::CONTENT_TYPE, FHIR_JSON)
                    .body(body.to_string());
                match (op.operation, op.base_version) {
                    (OperationKind::Update, Some(version)) => builder.header(IF_MATCH, weak_etag(version)),
                    _ => builder.header(IF_NONE_MATCH, "*"),
                }
            }
            OperationKind::Delete => {
                let builder = self.client.delete(&url);
                match op.base_version {
                    Some(version) => builder.header(IF_MATCH, weak_etag(version)),
                    None => builder,
                }
            }
        };

        log::debug!("Pushing {} {} (base {:?})", op.operation.as_str(), key, op.base_version);
        let response = self.authorized(request).await.send().await?;
        let status = response.status();

        if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
            let remote_version = version_from_headers(response.headers());
            log::warn!("Version conflict pushing {} (server {:?})", key, remote_version);
            return Err(ApiError::VersionConflict { remote_version });
        }

        // already gone is a successful delete
        if op.operation == OperationKind::Delete
            && (status == StatusCode::NOT_FOUND || status == StatusCode::GONE)
        {
            return Ok(PushAck { version: None });
        }

        if !status.is_success() {
            return Err(handle_error(response).await);
        }

        let header_version = version_from_headers(response.headers());
        if header_version.is_some() || op.operation == OperationKind::Delete {
            return Ok(PushAck { version: header_version });
        }

        let text = response.text().await?;
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("push body: {}", e)))?;
        let version = meta_version(&body)
            .ok_or_else(|| ApiError::InvalidResponse(format!("no version returned for {}", key)))?;
        Ok(PushAck { version: Some(version) })
    }

    async fn fetch(&self, key: &ResourceKey) -> Result<Option<RemoteResource>, ApiError> {
        let request = self.client.get(self.resource_url(key));
        let response = self.authorized(request).await.send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(handle_error(response).await);
        }

        let header_version = version_from_headers(response.headers());
        let text = response.text().await?;
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("fetch body: {}", e)))?;

        let version = header_version
            .or_else(|| meta_version(&body))
            .ok_or_else(|| ApiError::InvalidResponse(format!("no version for {}", key)))?;

        Ok(Some(RemoteResource {
            key: key.clone(),
            version,
            last_modified: meta_last_updated(&body).unwrap_or_else(Utc::now),
            deleted: false,
            resource: Some(body),
        }))
    }

    async fn pull(
        &self,
        since: Option<DateTime<Utc>>,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<ChangePage, ApiError> {
        let request = match cursor {
            Some(next) => self.client.get(next),
            None => {
                let mut query = vec![
                    ("_count".to_string(), page_size.to_string()),
                    ("_sort".to_string(), "_lastUpdated".to_string()),
                ];
                if let Some(since) = since {
                    query.push(("_since".to_string(), since.to_rfc3339_opts(SecondsFormat::Millis, true)));
                }
                self.client.get(format!("{}/_history", self.base_url)).query(&query)
            }
        };

        let response = self.authorized(request).await.send().await?;
        let bundle: Bundle = handle_response(response).await?;

        let entries = bundle
            .entry
            .into_iter()
            .map(BundleEntry::into_remote)
            .collect::<Result<Vec<_>, _>>()?;
        let next = bundle
            .link
            .into_iter()
            .find(|link| link.relation == "next")
            .map(|link| link.url);

        log::debug!("Pulled page of {} changes (more: {})", entries.len(), next.is_some());
        Ok(ChangePage { entries, next })
    }
}

// ============================================================================
// FHIR Wire Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct Bundle {
    #[serde(default)]
    entry: Vec<BundleEntry>,
    #[serde(default)]
    link: Vec<BundleLink>,
}

#[derive(Debug, Clone, Deserialize)]
struct BundleLink {
    relation: String,
    url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct BundleEntry {
    resource: Option<Value>,
    request: Option<EntryRequest>,
    response: Option<EntryResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct EntryRequest {
    method: String,
    url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryResponse {
    etag: Option<String>,
    last_modified: Option<DateTime<Utc>>,
}

impl BundleEntry {
    fn into_remote(self) -> Result<RemoteResource, ApiError> {
        let deleted = self
            .request
            .as_ref()
            .is_some_and(|req| req.method.eq_ignore_ascii_case("DELETE"))
            || self.resource.is_none();

        let key = match &self.resource {
            Some(resource) => key_from_resource(resource),
            None => self.request.as_ref().and_then(|req| key_from_url(&req.url)),
        }
        .ok_or_else(|| ApiError::InvalidResponse("history entry without resource identity".to_string()))?;

        let version = self
            .resource
            .as_ref()
            .and_then(meta_version)
            .or_else(|| self.response.as_ref().and_then(|r| r.etag.as_deref()).and_then(parse_etag))
            .ok_or_else(|| ApiError::InvalidResponse(format!("history entry {} has no version", key)))?;

        let last_modified = self
            .resource
            .as_ref()
            .and_then(meta_last_updated)
            .or_else(|| self.response.as_ref().and_then(|r| r.last_modified))
            .ok_or_else(|| ApiError::InvalidResponse(format!("history entry {} has no timestamp", key)))?;

        Ok(RemoteResource {
            key,
            version,
            last_modified,
            deleted,
            resource: if deleted { None } else { self.resource },
        })
    }
}

fn weak_etag(version: i64) -> String {
    format!("W/\"{}\"", version)
}

/// `W/"3"` or `"3"` -> 3
pub fn parse_etag(raw: &str) -> Option<i64> {
    raw.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .parse()
        .ok()
}

fn version_from_headers(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_etag)
}

fn meta_version(resource: &Value) -> Option<i64> {
    match resource.pointer("/meta/versionId")? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn meta_last_updated(resource: &Value) -> Option<DateTime<Utc>> {
    resource
        .pointer("/meta/lastUpdated")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn key_from_resource(resource: &Value) -> Option<ResourceKey> {
    let resource_type = resource.get("resourceType")?.as_str()?;
    let id = resource.get("id")?.as_str()?;
    Some(ResourceKey::new(resource_type, id))
}

/// `Patient/42` or `Patient/42/_history/3`
fn key_from_url(url: &str) -> Option<ResourceKey> {
    let mut parts = url.trim_start_matches('/').split('/');
    let resource_type = parts.next().filter(|s| !s.is_empty())?;
    let id = parts.next().filter(|s| !s.is_empty())?;
    Some(ResourceKey::new(resource_type, id))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Version conflict (server version {remote_version:?})")]
    VersionConflict { remote_version: Option<i64> },

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Client error: {0}")]
    Client(String),
}

impl ApiError {
    /// Network failures, timeouts, 408, 429 and 5xx are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Http { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let status = response.status();

    if status.is_success() {
        let text = response.text().await?;
        serde_json::from_str::<T>(&text).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to ApiError
async fn handle_error(response: reqwest::Response) -> ApiError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => ApiError::VersionConflict {
            remote_version: version_from_headers(response.headers()),
        },
        _ => {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            ApiError::Http {
                status: status.as_u16(),
                body,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{EncryptedEnvelope, OperationStatus, ENVELOPE_VERSION};
    use mockito::Matcher;
    use serde_json::json;

    fn client(url: &str) -> FhirApiClient {
        FhirApiClient::new(url, Duration::from_secs(5)).unwrap()
    }

    fn operation(kind: OperationKind, base_version: Option<i64>) -> SyncOperation {
        SyncOperation {
            id: "op-1".to_string(),
            resource_type: "Patient".to_string(),
            resource_id: "42".to_string(),
            operation: kind,
            payload: (kind != OperationKind::Delete).then(|| EncryptedEnvelope {
                ciphertext: "c".to_string(),
                iv: "i".to_string(),
                salt: "s".to_string(),
                timestamp: Utc::now(),
                version: ENVELOPE_VERSION,
            }),
            base_version,
            local_version: 3,
            enqueued_at: Utc::now(),
            status: OperationStatus::Queued,
            retry_count: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_parse_etag() {
        assert_eq!(parse_etag("W/\"3\""), Some(3));
        assert_eq!(parse_etag("\"12\""), Some(12));
        assert_eq!(parse_etag("W/\"abc\""), None);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ApiError::Timeout.is_retryable());
        assert!(ApiError::Network("reset".to_string()).is_retryable());
        for status in [408, 429, 500, 503] {
            assert!(ApiError::Http { status, body: String::new() }.is_retryable());
        }
        for status in [400, 403, 404, 422] {
            assert!(!ApiError::Http { status, body: String::new() }.is_retryable());
        }
        assert!(!ApiError::VersionConflict { remote_version: Some(4) }.is_retryable());
        assert!(!ApiError::Unauthorized.is_retryable());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(matches!(
            FhirApiClient::new("not a url", Duration::from_secs(1)),
            Err(ApiError::Client(_))
        ));
    }

    #[tokio::test]
    async fn test_token_management() {
        let client = client("http://localhost:1");
        assert!(client.get_token().await.is_none());

        client.set_token("test_token".to_string()).await;
        assert_eq!(client.get_token().await, Some("test_token".to_string()));

        client.clear_token().await;
        assert!(client.get_token().await.is_none());
    }

    #[tokio::test]
    async fn test_update_sends_if_match_and_reads_etag() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/Patient/42")
            .match_header("if-match", "W/\"2\"")
            .match_body(Matcher::PartialJson(json!({"resourceType": "Patient", "id": "42"})))
            .with_status(200)
            .with_header("etag", "W/\"3\"")
            .with_body(r#"{"resourceType":"Patient","id":"42","meta":{"versionId":"3"}}"#)
            .create_async()
            .await;

        let ack = client(&server.url())
            .push(&operation(OperationKind::Update, Some(2)), Some(&json!({"name": "A"})))
            .await
            .unwrap();

        assert_eq!(ack.version, Some(3));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_sends_if_none_match_and_reads_body_version() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/Patient/42")
            .match_header("if-none-match", "*")
            .with_status(201)
            .with_body(r#"{"resourceType":"Patient","id":"42","meta":{"versionId":"1"}}"#)
            .create_async()
            .await;

        let ack = client(&server.url())
            .push(&operation(OperationKind::Create, None), Some(&json!({})))
            .await
            .unwrap();

        assert_eq!(ack.version, Some(1));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_precondition_failure_is_version_conflict() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/Patient/42")
            .with_status(412)
            .with_header("etag", "W/\"4\"")
            .create_async()
            .await;

        let err = client(&server.url())
            .push(&operation(OperationKind::Update, Some(2)), Some(&json!({})))
            .await
            .unwrap_err();

        assert_eq!(err, ApiError::VersionConflict { remote_version: Some(4) });
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/Patient/42")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let err = client(&server.url())
            .push(&operation(OperationKind::Update, Some(2)), Some(&json!({})))
            .await
            .unwrap_err();

        assert_eq!(err, ApiError::Http { status: 503, body: "maintenance".to_string() });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_delete_of_missing_resource_succeeds() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/Patient/42")
            .match_header("if-match", "W/\"5\"")
            .with_status(404)
            .create_async()
            .await;

        let ack = client(&server.url())
            .push(&operation(OperationKind::Delete, Some(5)), None)
            .await
            .unwrap();
        assert_eq!(ack.version, None);
    }

    #[tokio::test]
    async fn test_fetch_missing_returns_none() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/Patient/9").with_status(404).create_async().await;

        let result = client(&server.url())
            .fetch(&ResourceKey::new("Patient", "9"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_pull_parses_history_bundle() {
        let mut server = mockito::Server::new_async().await;
        let next_url = format!("{}/_history?page=2", server.url());
        let body = json!({
            "resourceType": "Bundle",
            "type": "history",
            "link": [{"relation": "next", "url": next_url}],
            "entry": [
                {
                    "resource": {
                        "resourceType": "Patient",
                        "id": "1",
                        "meta": {"versionId": "2", "lastUpdated": "2026-03-01T10:00:00Z"}
                    },
                    "request": {"method": "PUT", "url": "Patient/1"}
                },
                {
                    "request": {"method": "DELETE", "url": "Observation/7"},
                    "response": {"etag": "W/\"4\"", "lastModified": "2026-03-01T11:00:00Z"}
                }
            ]
        });

        server
            .mock("GET", "/_history")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("_count".into(), "50".into()),
                Matcher::UrlEncoded("_sort".into(), "_lastUpdated".into()),
            ]))
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let page = client(&server.url()).pull(None, 50, None).await.unwrap();

        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].key, ResourceKey::new("Patient", "1"));
        assert_eq!(page.entries[0].version, 2);
        assert!(!page.entries[0].deleted);
        assert_eq!(page.entries[1].key, ResourceKey::new("Observation", "7"));
        assert_eq!(page.entries[1].version, 4);
        assert!(page.entries[1].deleted);
        assert_eq!(page.next, Some(next_url));
    }
}
