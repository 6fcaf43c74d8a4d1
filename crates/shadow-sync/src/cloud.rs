//! The cloud shadow service client: `GetThingShadow` / `UpdateThingShadow` /
//! `DeleteThingShadow` against a remote REST endpoint, following
//! `at_integrations::gitlab::GitLabClient` — a `reqwest::Client` wrapper with
//! one error enum mapping HTTP status codes to the taxonomy §6/§7 need.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors a cloud call can fail with, already classified the way the
/// retryer needs: transient vs. permanent vs. version conflict.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud shadow not found")]
    ResourceNotFound,

    #[error("cloud throttling: {0}")]
    Throttling(String),

    #[error("cloud service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("cloud internal failure: {0}")]
    InternalFailure(String),

    #[error("cloud version conflict: {0}")]
    Conflict(String),

    #[error("cloud request unauthorized: {0}")]
    Unauthorized(String),

    #[error("cloud payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("cloud rejected request ({status}): {body}")]
    OtherClient { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("response body was not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CloudError>;

/// The cloud shadow service, as consumed by the sync request executors.
/// Kept as a trait so tests can substitute a stub without a real endpoint.
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn get_thing_shadow(&self, thing_name: &str, shadow_name: &str) -> Result<Option<Value>>;
    async fn update_thing_shadow(
        &self,
        thing_name: &str,
        shadow_name: &str,
        payload: &Value,
    ) -> Result<Value>;
    async fn delete_thing_shadow(&self, thing_name: &str, shadow_name: &str) -> Result<()>;

    /// Test-only downcast hook so reconciliation tests can seed/inspect a
    /// `StubCloudClient` behind the trait object without a full `Any` dance.
    #[cfg(any(test, feature = "test-util"))]
    fn as_any_stub(&self) -> Option<&stub::StubCloudClient> {
        None
    }
}

/// `reqwest`-backed implementation against a configurable base URL, mirroring
/// `GitLabClient`'s `api_get`/`api_post` request helpers and status-to-error
/// mapping.
#[derive(Debug, Clone)]
pub struct ReqwestCloudClient {
    base_url: String,
    client: reqwest::Client,
}

impl ReqwestCloudClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn shadow_path(&self, thing_name: &str, shadow_name: &str) -> String {
        if shadow_name.is_empty() {
            format!("{}/things/{}/shadow", self.base_url, thing_name)
        } else {
            format!(
                "{}/things/{}/shadow/name/{}",
                self.base_url, thing_name, shadow_name
            )
        }
    }

    fn map_error_status(status: reqwest::StatusCode, body: String) -> CloudError {
        match status.as_u16() {
            404 => CloudError::ResourceNotFound,
            409 => CloudError::Conflict(body),
            401 | 403 => CloudError::Unauthorized(body),
            413 => CloudError::PayloadTooLarge(body),
            429 => CloudError::Throttling(body),
            503 => CloudError::ServiceUnavailable(body),
            500 | 502 | 504 => CloudError::InternalFailure(body),
            other => CloudError::OtherClient { status: other, body },
        }
    }
}

#[async_trait]
impl CloudClient for ReqwestCloudClient {
    async fn get_thing_shadow(&self, thing_name: &str, shadow_name: &str) -> Result<Option<Value>> {
        let url = self.shadow_path(thing_name, shadow_name);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_error_status(status, body));
        }
        let value: Value = resp.json().await?;
        Ok(Some(value))
    }

    async fn update_thing_shadow(
        &self,
        thing_name: &str,
        shadow_name: &str,
        payload: &Value,
    ) -> Result<Value> {
        let url = self.shadow_path(thing_name, shadow_name);
        let resp = self.client.post(&url).json(payload).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_error_status(status, body));
        }
        let value: Value = resp.json().await?;
        Ok(value)
    }

    async fn delete_thing_shadow(&self, thing_name: &str, shadow_name: &str) -> Result<()> {
        let url = self.shadow_path(thing_name, shadow_name);
        let resp = self.client.delete(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_error_status(status, body));
        }
        Ok(())
    }
}

/// An in-memory stand-in used by tests and by the full-sync reconciliation
/// test suite, so `shadow-sync`'s own logic can be exercised without a real
/// endpoint.
#[cfg(any(test, feature = "test-util"))]
pub mod stub {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct StubCloudClient {
        documents: Mutex<HashMap<(String, String), Value>>,
        pub fail_next_update: std::sync::atomic::AtomicBool,
    }

    impl StubCloudClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn seed(&self, thing_name: &str, shadow_name: &str, value: Value) {
            self.documents
                .lock()
                .await
                .insert((thing_name.to_string(), shadow_name.to_string()), value);
        }

        /// Synchronous-feeling test accessor: the document currently held for
        /// `(thing_name, shadow_name)`, if any.
        pub async fn get(&self, thing_name: &str, shadow_name: &str) -> Option<Value> {
            self.documents
                .lock()
                .await
                .get(&(thing_name.to_string(), shadow_name.to_string()))
                .cloned()
        }
    }

    #[async_trait]
    impl CloudClient for StubCloudClient {
        async fn get_thing_shadow(
            &self,
            thing_name: &str,
            shadow_name: &str,
        ) -> Result<Option<Value>> {
            Ok(self
                .documents
                .lock()
                .await
                .get(&(thing_name.to_string(), shadow_name.to_string()))
                .cloned())
        }

        async fn update_thing_shadow(
            &self,
            thing_name: &str,
            shadow_name: &str,
            payload: &Value,
        ) -> Result<Value> {
            if self
                .fail_next_update
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(CloudError::ServiceUnavailable("stub failure".into()));
            }
            let mut docs = self.documents.lock().await;
            let key = (thing_name.to_string(), shadow_name.to_string());
            let current = docs.get(&key).cloned().unwrap_or(Value::Object(Default::default()));
            let merged = shadow_core::json_merge::merge(&current, payload);
            docs.insert(key, merged.clone());
            Ok(merged)
        }

        async fn delete_thing_shadow(&self, thing_name: &str, shadow_name: &str) -> Result<()> {
            self.documents
                .lock()
                .await
                .remove(&(thing_name.to_string(), shadow_name.to_string()));
            Ok(())
        }

        fn as_any_stub(&self) -> Option<&StubCloudClient> {
            Some(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_path_handles_classic_and_named() {
        let client = ReqwestCloudClient::new("https://example.com", Duration::from_secs(5));
        assert_eq!(
            client.shadow_path("robot-1", ""),
            "https://example.com/things/robot-1/shadow"
        );
        assert_eq!(
            client.shadow_path("robot-1", "config"),
            "https://example.com/things/robot-1/shadow/name/config"
        );
    }

    #[test]
    fn status_mapping_matches_spec_taxonomy() {
        use reqwest::StatusCode;
        assert!(matches!(
            ReqwestCloudClient::map_error_status(StatusCode::NOT_FOUND, String::new()),
            CloudError::ResourceNotFound
        ));
        assert!(matches!(
            ReqwestCloudClient::map_error_status(StatusCode::CONFLICT, String::new()),
            CloudError::Conflict(_)
        ));
        assert!(matches!(
            ReqwestCloudClient::map_error_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            CloudError::Throttling(_)
        ));
        assert!(matches!(
            ReqwestCloudClient::map_error_status(StatusCode::SERVICE_UNAVAILABLE, String::new()),
            CloudError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            ReqwestCloudClient::map_error_status(StatusCode::BAD_REQUEST, String::new()),
            CloudError::OtherClient { status: 400, .. }
        ));
    }
}
