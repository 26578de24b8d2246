//! Remote API contract and its HTTP client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{EntityKind, RemoteRecord};
use crate::util::{compact_text, normalize_text_option};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Completion toggle for one habit on one day.
///
/// Entry creates, updates and deletes all go through this call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleRequest {
    /// Server id of the owning habit
    pub habit_id: String,
    /// `YYYY-MM-DD`
    pub date: String,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Server id of the entry, once it has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
}

/// One call per sync operation.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create_entity(&self, kind: EntityKind, payload: &Value) -> Result<RemoteRecord>;

    async fn update_entity(
        &self,
        kind: EntityKind,
        server_id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord>;

    async fn delete_entity(&self, kind: EntityKind, server_id: &str) -> Result<()>;

    /// Returns the entry as stored remotely, or `None` once it no longer exists.
    async fn toggle_completion(&self, request: &ToggleRequest) -> Result<Option<RemoteRecord>>;
}

/// [`RemoteApi`] over JSON HTTP
#[derive(Clone)]
pub struct HttpRemoteApi {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteApi {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteApi")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpRemoteApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        Self::with_timeout(base_url, token, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url.into())?,
            token: normalize_text_option(token),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, self.url(path))
            .header("Accept", "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(Error::Remote {
            status: status.as_u16(),
            message: parse_api_error(status, &body),
        })
    }
}

const fn resource(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Habit => "habits",
        EntityKind::HabitEntry => "entries",
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create_entity(&self, kind: EntityKind, payload: &Value) -> Result<RemoteRecord> {
        let response = self
            .send(self.request(reqwest::Method::POST, resource(kind)).json(payload))
            .await?;
        Ok(response.json().await?)
    }

    async fn update_entity(
        &self,
        kind: EntityKind,
        server_id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord> {
        let path = format!("{}/{server_id}", resource(kind));
        let response = self
            .send(self.request(reqwest::Method::PUT, &path).json(payload))
            .await
            .map_err(|error| conflict_on(server_id, error))?;
        Ok(response.json().await?)
    }

    async fn delete_entity(&self, kind: EntityKind, server_id: &str) -> Result<()> {
        let path = format!("{}/{server_id}", resource(kind));
        self.send(self.request(reqwest::Method::DELETE, &path))
            .await
            .map_err(|error| conflict_on(server_id, error))?;
        Ok(())
    }

    async fn toggle_completion(&self, request: &ToggleRequest) -> Result<Option<RemoteRecord>> {
        let path = format!("habits/{}/completions", request.habit_id);
        let response = self
            .send(self.request(reqwest::Method::POST, &path).json(request))
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_str::<Option<RemoteRecord>>(&body)?)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return compact_text(&message);
        }
    }

    let compacted = compact_text(body);
    if compacted.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        compacted
    }
}

/// A 409 on an existing entity means the server copy moved on.
fn conflict_on(server_id: &str, error: Error) -> Error {
    match error {
        Error::Remote {
            status: 409,
            message,
        } => Error::Conflict {
            entity_id: server_id.to_string(),
            reason: message,
        },
        other => other,
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::ValidationFailed("API URL must not be empty".to_string()))?;
    if crate::util::is_http_url(&url) {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(Error::ValidationFailed(
            "API URL must include http:// or https://".to_string(),
        ))
    }
}
