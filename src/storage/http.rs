//! HTTP-backed blob store for a Drive-like REST service.
//!
//! Thin, strongly-typed wrapper over the remote endpoints:
//! - `GET/POST {base}/folders` — folder lookup and creation
//! - `GET {base}/files?folder_id=…&name=…&page=…` — listing
//! - `POST {base}/files` — upload (JSON body, base64 payload)
//! - `GET {base}/files/{id}/content` — download
//! - `DELETE {base}/files/{id}` — delete
//!
//! Every call carries a bearer token from the [`TokenSource`]; a 401
//! invalidates the token and retries exactly once with a fresh one. A
//! 429 surfaces as `RateLimited` with the server's `Retry-After`.

use super::{BlobHandle, BlobMeta, BlobStore, StoreError, TokenSource};
use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Default per-call upper bound.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Fallback wait when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Connection settings for the remote service.
#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Service root, e.g. `https://blobs.example.com/v1`.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl HttpStoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// REST adapter over the remote object service.
pub struct HttpStore {
    config: HttpStoreConfig,
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
struct FolderEntry {
    id: String,
}

impl HttpStore {
    pub fn new(config: HttpStoreConfig, tokens: Arc<dyn TokenSource>) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StoreError::Fatal(format!("http client init: {e}")))?;
        Ok(Self {
            config,
            http,
            tokens,
        })
    }

    fn folders_url(&self) -> String {
        format!("{}/folders", self.config.base_url)
    }

    fn files_url(&self) -> String {
        format!("{}/files", self.config.base_url)
    }

    /// Run a request with a bearer token; on 401, refresh the token once
    /// and retry.
    async fn authorized<F>(&self, make: F) -> Result<reqwest::Response, StoreError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let token = self.tokens.get(false).await?;
        let response = make(&self.http, &token)
            .send()
            .await
            .map_err(request_error)?;

        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        tracing::debug!("remote store rejected token, refreshing once");
        self.tokens.invalidate(&token).await;
        let fresh = self.tokens.get(false).await?;
        let retried = make(&self.http, &fresh)
            .send()
            .await
            .map_err(request_error)?;
        if retried.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(StoreError::Unauthorized);
        }
        check_status(retried).await
    }
}

fn request_error(err: reqwest::Error) -> StoreError {
    // Connection refusals, DNS failures and timeouts are all worth a
    // backoff retry.
    StoreError::Transient(err.to_string())
}

/// Map a non-401 response to a typed error or pass it through.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        return Err(StoreError::RateLimited(secs));
    }
    if status == reqwest::StatusCode::INSUFFICIENT_STORAGE {
        return Err(StoreError::QuotaExceeded);
    }
    if status == reqwest::StatusCode::FORBIDDEN {
        let body = response.text().await.unwrap_or_default();
        if body.contains("quota") {
            return Err(StoreError::QuotaExceeded);
        }
        return Err(StoreError::Fatal(format!("forbidden: {body}")));
    }
    if status.is_server_error() {
        return Err(StoreError::Transient(format!("server returned {status}")));
    }
    Err(StoreError::Fatal(format!("unexpected status {status}")))
}

#[async_trait]
impl BlobStore for HttpStore {
    async fn find_or_create_folder(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<String, StoreError> {
        let url = self.folders_url();
        let response = self
            .authorized(|http, token| {
                let mut req = http.get(&url).bearer_auth(token).query(&[("name", name)]);
                if let Some(parent) = parent {
                    req = req.query(&[("parent", parent)]);
                }
                req
            })
            .await?;
        let existing: Vec<FolderEntry> = response
            .json()
            .await
            .map_err(|e| StoreError::Fatal(format!("folder list decode: {e}")))?;
        if let Some(folder) = existing.into_iter().next() {
            return Ok(folder.id);
        }

        let body = serde_json::json!({ "name": name, "parent": parent });
        let created: IdResponse = self
            .authorized(|http, token| http.post(&url).bearer_auth(token).json(&body))
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Fatal(format!("folder create decode: {e}")))?;
        Ok(created.id)
    }

    async fn list(
        &self,
        folder_id: &str,
        query: Option<&str>,
        page: Option<u32>,
    ) -> Result<Vec<BlobMeta>, StoreError> {
        let url = self.files_url();
        let response = self
            .authorized(|http, token| {
                let mut req = http
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("folder_id", folder_id)]);
                if let Some(name) = query {
                    req = req.query(&[("name", name)]);
                }
                if let Some(page) = page {
                    req = req.query(&[("page", page.to_string().as_str())]);
                }
                req
            })
            .await?;
        response
            .json()
            .await
            .map_err(|e| StoreError::Fatal(format!("file list decode: {e}")))
    }

    async fn upload(
        &self,
        name: &str,
        bytes: &[u8],
        folder_id: &str,
    ) -> Result<BlobHandle, StoreError> {
        let url = self.files_url();
        let body = serde_json::json!({
            "name": name,
            "folder_id": folder_id,
            "data": base64::engine::general_purpose::STANDARD.encode(bytes),
        });
        let response = self
            .authorized(|http, token| http.post(&url).bearer_auth(token).json(&body))
            .await?;
        response
            .json()
            .await
            .map_err(|e| StoreError::Fatal(format!("upload decode: {e}")))
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let url = format!("{}/{}/content", self.files_url(), id);
        let response = self
            .authorized(|http, token| http.get(&url).bearer_auth(token))
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::Transient(format!("download body: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let url = format!("{}/{}", self.files_url(), id);
        self.authorized(|http, token| http.delete(&url).bearer_auth(token))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Token source that hands out "stale" until invalidated, then
    /// "fresh".
    struct RotatingToken {
        invalidated: Mutex<bool>,
    }

    impl RotatingToken {
        fn new() -> Self {
            Self {
                invalidated: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl TokenSource for RotatingToken {
        async fn get(&self, _interactive: bool) -> Result<String, StoreError> {
            if *self.invalidated.lock() {
                Ok("fresh".into())
            } else {
                Ok("stale".into())
            }
        }

        async fn invalidate(&self, _token: &str) {
            *self.invalidated.lock() = true;
        }
    }

    fn store_for(server: &MockServer, tokens: Arc<dyn TokenSource>) -> HttpStore {
        HttpStore::new(HttpStoreConfig::new(server.uri()), tokens).unwrap()
    }

    #[tokio::test]
    async fn download_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/blob-1/content"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;

        let store = store_for(&server, Arc::new(super::super::StaticToken("tok".into())));
        assert_eq!(store.download("blob-1").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn unauthorized_refreshes_token_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/blob-1/content"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/blob-1/content"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let store = store_for(&server, Arc::new(RotatingToken::new()));
        assert_eq!(store.download("blob-1").await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn persistent_unauthorized_surfaces_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/blob-1/content"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let store = store_for(&server, Arc::new(RotatingToken::new()));
        assert_eq!(
            store.download("blob-1").await.unwrap_err(),
            StoreError::Unauthorized
        );
    }

    #[tokio::test]
    async fn rate_limit_extracts_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("retry-after", "42"),
            )
            .mount(&server)
            .await;

        let store = store_for(&server, Arc::new(super::super::StaticToken("tok".into())));
        assert_eq!(
            store.list("folder-1", None, None).await.unwrap_err(),
            StoreError::RateLimited(42)
        );
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/files/blob-1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store = store_for(&server, Arc::new(super::super::StaticToken("tok".into())));
        assert!(matches!(
            store.delete("blob-1").await.unwrap_err(),
            StoreError::Transient(_)
        ));
    }

    #[tokio::test]
    async fn folder_lookup_prefers_existing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/folders"))
            .and(query_param("name", "backups"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([{ "id": "f-9" }])),
            )
            .mount(&server)
            .await;

        let store = store_for(&server, Arc::new(super::super::StaticToken("tok".into())));
        assert_eq!(
            store.find_or_create_folder("backups", None).await.unwrap(),
            "f-9"
        );
    }
}
