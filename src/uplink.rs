//! Uplink to the management server: node registration, heartbeat and event ingest.

use crate::config::ServerConfig;
use crate::event::{Details, Severity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const REGISTER_PATH: &str = "/api/v1/nodes/register";
const HEARTBEAT_PATH: &str = "/api/v1/nodes/heartbeat";
const INGEST_PATH: &str = "/api/v1/logs/ingest";
const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http transport error: {0}")]
    Transport(String),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid server response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistrationRequest {
    pub hostname: String,
    pub ip_address: String,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventIngestRequest {
    pub node_id: i64,
    pub event_type: String,
    pub severity: Severity,
    pub details: Details,
}

/// Node record as returned by register and heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: i64,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub status: String,
    /// Kept as text: the server may omit the UTC offset.
    #[serde(default)]
    pub last_seen: Option<String>,
}

/// Server operations the agent depends on. Every call fails on a non-success response.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn register(&self, request: &NodeRegistrationRequest) -> Result<NodeInfo, ApiError>;
    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<NodeInfo, ApiError>;
    async fn ingest_event(&self, request: &EventIngestRequest) -> Result<(), ApiError>;
}

pub struct HttpApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpApiClient {
    pub fn new(config: &ServerConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let res = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        Ok(res)
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn register(&self, request: &NodeRegistrationRequest) -> Result<NodeInfo, ApiError> {
        self.post(REGISTER_PATH, request)
            .await?
            .json::<NodeInfo>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<NodeInfo, ApiError> {
        self.post(HEARTBEAT_PATH, request)
            .await?
            .json::<NodeInfo>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn ingest_event(&self, request: &EventIngestRequest) -> Result<(), ApiError> {
        self.post(INGEST_PATH, request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ingest_body_shape() {
        let mut details = Details::new();
        details.insert("remote_port".into(), json!(4444));
        let req = EventIngestRequest {
            node_id: 7,
            event_type: "network_connection".into(),
            severity: Severity::High,
            details,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            json!({
                "node_id": 7,
                "event_type": "network_connection",
                "severity": "high",
                "details": { "remote_port": 4444 }
            })
        );
    }

    #[test]
    fn node_info_tolerates_missing_optionals() {
        let info: NodeInfo = serde_json::from_value(json!({
            "id": 3,
            "hostname": "ws-01",
            "ip_address": "10.0.0.5",
            "status": "online"
        }))
        .unwrap();
        assert_eq!(info.id, 3);
        assert!(info.group.is_none());
        assert!(info.last_seen.is_none());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let cfg = ServerConfig {
            api_url: "http://127.0.0.1:5000/".into(),
            api_key: "k".into(),
            request_timeout_secs: 5,
        };
        let c = HttpApiClient::new(&cfg).unwrap();
        assert_eq!(c.base_url, "http://127.0.0.1:5000");
    }
}
