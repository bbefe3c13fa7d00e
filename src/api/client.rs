use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client as HttpClient, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::api::models::{Conversation, Message};
use crate::auth::AuthProvider;
use crate::error::{ChatError, Result};

/// Durable history, owned by the backend.
#[async_trait]
pub trait HistoryService: Send + Sync {
    async fn conversation_summaries(&self) -> Result<Vec<Conversation>>;
    async fn messages(&self, peer_id: &str) -> Result<Vec<Message>>;
}

pub struct HttpHistoryService {
    http: HttpClient,
    base_api: String,
    auth: Arc<dyn AuthProvider>,
}

impl HttpHistoryService {
    pub fn new(base_url: &str, timeout: Duration, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_api: Self::base_api(base_url),
            auth,
        })
    }

    /// Appends `segments` to the API root, percent-encoding each one.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_api)
            .map_err(|e| ChatError::Config(format!("invalid history service URL {}: {}", self.base_api, e)))?;
        url.path_segments_mut()
            .map_err(|_| ChatError::Config(format!("history service URL {} cannot take a path", self.base_api)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn base_api(base_url: &str) -> String {
        let trimmed = base_url.trim_end_matches('/');
        if trimmed.ends_with("/api") { trimmed.to_string() } else { format!("{}/api", trimmed) }
    }

    fn with_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match self.auth.token() {
            Some(t) => req.header("Authorization", format!("Bearer {}", t)),
            None => req,
        }
    }

    async fn get_json(&self, segments: &[&str]) -> Result<Value> {
        let endpoint = self.endpoint(segments)?;
        debug!("GET {}", endpoint);
        let resp = self
            .with_auth(self.http.get(endpoint.clone()))
            .send()
            .await
            .map_err(|e| ChatError::History(e.to_string()))?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => {
                self.auth.reject();
                Err(ChatError::Auth("history service rejected the token".into()))
            }
            status if !status.is_success() => Err(ChatError::History(format!("HTTP {} from {}", status, endpoint))),
            _ => resp.json::<Value>().await.map_err(|e| ChatError::History(e.to_string())),
        }
    }
}

/// Accepts a bare array or one wrapped under `data` or `key`.
fn unwrap_list<T: DeserializeOwned>(json: Value, key: &str) -> Result<Vec<T>> {
    let items = match json {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data").or_else(|| map.remove(key)) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(ChatError::from))
        .collect()
}

#[async_trait]
impl HistoryService for HttpHistoryService {
    async fn conversation_summaries(&self) -> Result<Vec<Conversation>> {
        let json = self.get_json(&["conversations"]).await?;
        unwrap_list(json, "conversations")
    }

    async fn messages(&self, peer_id: &str) -> Result<Vec<Message>> {
        let json = self.get_json(&["messages", peer_id]).await?;
        unwrap_list(json, "messages")
    }
}
