//! REST collaborators: the public-key directory and call history.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Directory of published public keys, keyed by user id.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Publish (or replace) the caller's own public key.
    async fn publish_public_key(&self, public_key: &[u8]) -> Result<(), ProtocolError>;

    /// Fetch a user's public key. `None` when the user never published one.
    async fn fetch_public_key(&self, user_id: &str) -> Result<Option<Vec<u8>>, ProtocolError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallHistoryStatus {
    Completed,
    Missed,
    Declined,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryRecord {
    pub id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub status: CallHistoryStatus,
    /// Seconds connected; zero for calls that never connected.
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub started_at: Option<String>,
}

impl CallHistoryRecord {
    pub fn involves(&self, user_id: &str) -> bool {
        self.caller_id == user_id || self.receiver_id == user_id
    }
}

/// Call history kept by the backend.
#[async_trait]
pub trait CallHistoryApi: Send + Sync {
    async fn fetch_history(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CallHistoryRecord>, ProtocolError>;

    async fn delete_call(&self, call_id: &str) -> Result<(), ProtocolError>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyBody {
    public_key: String,
}

/// `reqwest` client for the REST backend, authenticated with a bearer token.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ProtocolError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("parley/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl KeyDirectory for HttpBackend {
    async fn publish_public_key(&self, public_key: &[u8]) -> Result<(), ProtocolError> {
        let res = self
            .client
            .put(self.url("/users/public-key"))
            .bearer_auth(&self.token)
            .json(&PublicKeyBody {
                public_key: STANDARD.encode(public_key),
            })
            .send()
            .await?;
        if res.status().is_success() {
            return Ok(());
        }
        Err(ProtocolError::Http(format!(
            "publishing public key failed: {}",
            res.status()
        )))
    }

    async fn fetch_public_key(&self, user_id: &str) -> Result<Option<Vec<u8>>, ProtocolError> {
        let res = self
            .client
            .get(self.url(&format!("/users/{user_id}/public-key")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(ProtocolError::Http(format!(
                "public key fetch for {user_id} failed: {}",
                res.status()
            )));
        }
        let body: PublicKeyBody = res.json().await?;
        if body.public_key.is_empty() {
            return Ok(None);
        }
        STANDARD
            .decode(body.public_key.as_bytes())
            .map(Some)
            .map_err(|e| ProtocolError::Deserialization(format!("public key for {user_id}: {e}")))
    }
}

#[async_trait]
impl CallHistoryApi for HttpBackend {
    async fn fetch_history(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CallHistoryRecord>, ProtocolError> {
        let res = self
            .client
            .get(self.url("/calls/history"))
            .query(&[("limit", limit), ("offset", offset)])
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(ProtocolError::Http(format!(
                "call history fetch failed: {}",
                res.status()
            )));
        }
        let body: Value = res.json().await?;
        parse_history(body)
    }

    async fn delete_call(&self, call_id: &str) -> Result<(), ProtocolError> {
        let res = self
            .client
            .delete(self.url(&format!("/calls/{call_id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if res.status().is_success() || res.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(ProtocolError::Http(format!(
            "deleting call {call_id} failed: {}",
            res.status()
        )))
    }
}

/// The history endpoint answers either a bare array or `{"calls": [...]}`.
fn parse_history(body: Value) -> Result<Vec<CallHistoryRecord>, ProtocolError> {
    let list = match body {
        Value::Object(mut map) => map.remove("calls").unwrap_or(Value::Array(Vec::new())),
        other => other,
    };
    serde_json::from_value(list).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}
