//! HTTP implementation of `MemoStore`.
//!
//! - `PUT {base}/memos/{id}` with body `{ title, content, version, requestId, seq }`
//!   and `If-Match: <version>`; `200` carries `{ version, seq }`, `409` (or
//!   `412`) is a version conflict.
//! - `GET {base}/memos/{id}` returns the authoritative memo.

use crate::memo::{Memo, WriteAck, WriteRequest};
use crate::store::{MemoStore, Result, StoreError};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, IF_MATCH};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Body of a successful write response. Extra fields are ignored.
#[derive(Debug, Deserialize)]
struct WriteResponse {
    version: u64,
    #[serde(default)]
    seq: Option<u64>,
}

/// Optional body of a `409` response.
#[derive(Debug, Deserialize)]
struct ConflictResponse {
    #[serde(default)]
    version: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HttpMemoStore {
    client: reqwest::Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpMemoStore {
    /// Create a store rooted at `base_url`.
    ///
    /// `request_timeout` bounds each HTTP request independently of the
    /// retry executor's attempt timeout.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| StoreError::Config(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Config(format!("{} cannot be a base URL", base_url)));
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            bearer_token: None,
        })
    }

    /// Attach a bearer credential to every request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn memo_url(&self, document_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Config(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .push("memos")
            .push(document_id);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        return StoreError::Timeout;
    }
    if err.is_decode() {
        return StoreError::Decode(err.to_string());
    }
    StoreError::Network(err.to_string())
}

/// Map a non-success status other than conflicts.
async fn status_error(document_id: &str, response: reqwest::Response) -> StoreError {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized,
        StatusCode::NOT_FOUND => StoreError::NotFound(document_id.to_string()),
        _ => {
            let body = response.text().await.unwrap_or_default();
            let reason = if body.is_empty() {
                status.canonical_reason().unwrap_or("").to_string()
            } else {
                body
            };
            StoreError::Status(status.as_u16(), reason)
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl MemoStore for HttpMemoStore {
    async fn write(&self, document_id: &str, request: &WriteRequest) -> Result<WriteAck> {
        let url = self.memo_url(document_id)?;
        debug!(
            "PUT {} (version {}, seq {}, request {})",
            url, request.version, request.seq, request.request_id
        );

        let response = self
            .authorize(self.client.put(url))
            // Sent in both header and body in case an intermediary strips one
            .header(IF_MATCH, request.version.to_string())
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        match response.status() {
            status if status.is_success() => {
                let body: WriteResponse = response.json().await.map_err(map_reqwest_error)?;
                Ok(WriteAck {
                    version: body.version,
                    seq: body.seq.unwrap_or(request.seq),
                })
            }
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                let current_version = response
                    .json::<ConflictResponse>()
                    .await
                    .ok()
                    .and_then(|body| body.version);
                Err(StoreError::Conflict { current_version })
            }
            _ => Err(status_error(document_id, response).await),
        }
    }

    async fn fetch(&self, document_id: &str) -> Result<Memo> {
        let url = self.memo_url(document_id)?;
        debug!("GET {}", url);

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            return Err(status_error(document_id, response).await);
        }

        let mut memo: Memo = response.json().await.map_err(map_reqwest_error)?;
        if memo.id.is_empty() {
            memo.id = document_id.to_string();
        }
        Ok(memo)
    }
}
