//! Shared HTTP client for the Deckflow API.
//!
//! Provides a minimal client with optional API-key auth, generic GET/POST
//! helpers, and typed worker/dispatcher methods. The worker binary drives
//! its whole lifecycle (register, heartbeat, claim, progress, complete,
//! release) through this client.

pub mod api;

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;

/// API version prefix (matches the server's route prefix).
pub fn api_prefix() -> String {
    let version = std::env::var("DECKFLOW_API_VERSION").unwrap_or_else(|_| "v1".to_string());
    format!("/api/{}", version)
}

/// Error shape returned by the API (mirrors the server's ErrorResponse).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub recoverable: bool,
}

/// Client-side error taxonomy. `LeaseLost` is terminal for the current task
/// attempt; `Transport` and recoverable `Api` errors are retried by the
/// worker loop.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server answered 409 with code `lease_lost`: this worker no longer
    /// holds the task. The attempt must be aborted, never retried.
    #[error("lease lost: {0}")]
    LeaseLost(String),

    #[error("API request failed with status {status}: {message}")]
    Api {
        status: u16,
        message: String,
        code: String,
        recoverable: bool,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ClientError {
    /// Whether the worker loop should retry the call.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::LeaseLost(_) => false,
            ClientError::Api { recoverable, .. } => *recoverable,
            ClientError::Transport(_) => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// HTTP client for the Deckflow API with optional API-key auth.
#[derive(Clone, Debug)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: String, api_key: Option<String>) -> std::result::Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-API-Key", key.as_str()),
            None => request,
        }
    }

    async fn handle_error(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let body_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        match serde_json::from_str::<ApiErrorBody>(&body_text) {
            Ok(body) if body.code == "lease_lost" => ClientError::LeaseLost(body.error),
            Ok(body) => ClientError::Api {
                status,
                message: body.error,
                code: body.code,
                recoverable: body.recoverable,
            },
            Err(_) => ClientError::Api {
                status,
                message: body_text,
                code: String::new(),
                // Plain-text bodies come from proxies and crashes; treat
                // server-side statuses as retryable.
                recoverable: status >= 500,
            },
        }
    }

    /// GET request with optional query parameters. Deserializes JSON response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.build_url(path);
        let mut request = self.client.get(&url);
        request = self.apply_auth(request);
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// POST JSON body and deserialize response.
    pub async fn post_json<T: DeserializeOwned, B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.build_url(path);
        let request = self.client.post(&url).json(body);
        let request = self.apply_auth(request);

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// POST JSON body where the response may be 204 No Content. Returns
    /// `None` for 204, `Some(T)` otherwise.
    pub async fn post_json_optional<T: DeserializeOwned, B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>> {
        let url = self.build_url(path);
        let request = self.client.post(&url).json(body);
        let request = self.apply_auth(request);

        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }
        Ok(Some(response.json().await?))
    }

    /// Raw client for custom requests.
    pub fn client(&self) -> &Client {
        &self.client
    }
}
