use crate::model::{CaptureMetadata, Classification};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failure classes of the backend. `Offline` is load-bearing: the recognition
/// queue routes on it, and the sync queue treats it as retryable. It is a
/// distinct variant rather than a message substring so callers match on the
/// kind, never on error text.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("device is offline: {0}")]
    Offline(String),
    #[error("backend returned {code}: {body}")]
    Status { code: u16, body: String },
    #[error("invalid backend response: {0}")]
    Invalid(String),
}

impl RemoteError {
    pub fn is_offline(&self) -> bool {
        matches!(self, RemoteError::Offline(_))
    }

    /// A permanent failure cannot succeed on retry: client errors other than
    /// request-timeout (408) and rate-limit (429).
    pub fn is_permanent(&self) -> bool {
        match self {
            RemoteError::Status { code, .. } => {
                (400..500).contains(code) && *code != 408 && *code != 429
            }
            _ => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            RemoteError::Offline(err.to_string())
        } else {
            RemoteError::Invalid(err.to_string())
        }
    }
}

/// Backend contract the sync engine and recognition queue depend on. The real
/// implementation is [`BackendClient`]; tests substitute a scripted fake.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn insert(&self, table: &str, record: &Value) -> Result<(), RemoteError>;

    async fn update(&self, table: &str, id: &str, fields: &Value) -> Result<(), RemoteError>;

    /// Sets the remote `deleted_at`; the engine never issues physical deletes.
    async fn soft_delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;

    async fn query_updated_since(
        &self,
        table: &str,
        partitions: &[String],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, RemoteError>;

    /// Farm ids the authenticated user may access; the download phase scopes
    /// its queries to these partitions.
    async fn list_partitions(&self) -> Result<Vec<String>, RemoteError>;

    /// Single AI pest-identification call. Slow (seconds) and offline-failing;
    /// offline surfaces as `RemoteError::Offline`, never as an empty result.
    async fn classify(
        &self,
        image: &[u8],
        metadata: &CaptureMetadata,
    ) -> Result<Classification, RemoteError>;
}

#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl BackendClient {
    pub fn new(base_url: &str, api_key: String, timeout_secs: u64) -> Result<Self, RemoteError> {
        let base_url =
            Url::parse(base_url).map_err(|e| RemoteError::Invalid(format!("base url: {e}")))?;
        let http = Client::builder()
            .user_agent("agroscout/0.1")
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(RemoteError::from_reqwest)?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::Invalid(format!("endpoint {path}: {e}")))
    }

    async fn check(&self, res: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::GATEWAY_TIMEOUT {
            return Err(RemoteError::Offline(format!("backend unreachable: {status}")));
        }
        Err(RemoteError::Status {
            code: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RemoteService for BackendClient {
    async fn insert(&self, table: &str, record: &Value) -> Result<(), RemoteError> {
        let url = self.endpoint(&format!("v1/{table}"))?;
        debug!(%url, "insert");
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(record)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;
        self.check(res).await.map(|_| ())
    }

    async fn update(&self, table: &str, id: &str, fields: &Value) -> Result<(), RemoteError> {
        let url = self.endpoint(&format!("v1/{table}/{id}"))?;
        debug!(%url, "update");
        let res = self
            .http
            .patch(url)
            .bearer_auth(&self.api_key)
            .json(fields)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;
        self.check(res).await.map(|_| ())
    }

    async fn soft_delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let fields = serde_json::json!({ "deleted_at": Utc::now() });
        self.update(table, id, &fields).await
    }

    async fn query_updated_since(
        &self,
        table: &str,
        partitions: &[String],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, RemoteError> {
        let mut url = self.endpoint(&format!("v1/{table}"))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("farms", &partitions.join(","));
            if let Some(since) = since {
                q.append_pair("updated_since", &since.to_rfc3339());
            }
        }
        debug!(%url, "query updated since");
        let res = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;
        let res = self.check(res).await?;
        res.json().await.map_err(RemoteError::from_reqwest)
    }

    async fn list_partitions(&self) -> Result<Vec<String>, RemoteError> {
        let url = self.endpoint("v1/farms")?;
        let res = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;
        let res = self.check(res).await?;
        res.json().await.map_err(RemoteError::from_reqwest)
    }

    async fn classify(
        &self,
        image: &[u8],
        metadata: &CaptureMetadata,
    ) -> Result<Classification, RemoteError> {
        let mut url = self.endpoint("v1/classify")?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("farm_id", &metadata.farm_id);
            q.append_pair("plot_id", &metadata.plot_id);
            if let Some(lat) = metadata.latitude {
                q.append_pair("latitude", &lat.to_string());
            }
            if let Some(lon) = metadata.longitude {
                q.append_pair("longitude", &lon.to_string());
            }
        }
        debug!(%url, bytes = image.len(), "classify");
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;
        let res = self.check(res).await?;
        res.json().await.map_err(RemoteError::from_reqwest)
    }
}
