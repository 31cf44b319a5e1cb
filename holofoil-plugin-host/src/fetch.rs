//! Fetching plugin packages and serving the `http.get` host API.

use crate::error::{PluginHostError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Responses larger than this are refused.
pub const MAX_FETCH_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResource {
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResource {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[async_trait]
pub trait PluginFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedResource>;
}

/// reqwest-backed fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("Holofoil/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PluginHostError::Network(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PluginFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedResource> {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(PluginHostError::Network(format!("unsupported url: {url}")));
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PluginHostError::Network(format!("fetch failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(PluginHostError::Network(format!(
                "HTTP {} fetching {url}",
                resp.status()
            )));
        }
        if resp
            .content_length()
            .is_some_and(|len| len > MAX_FETCH_BYTES as u64)
        {
            return Err(PluginHostError::Network(format!("{url} is too large")));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes()
            .await
            .map_err(|e| PluginHostError::Network(format!("read body: {e}")))?;
        if body.len() > MAX_FETCH_BYTES {
            return Err(PluginHostError::Network(format!("{url} is too large")));
        }

        Ok(FetchedResource {
            url: url.to_string(),
            content_type,
            body: body.to_vec(),
        })
    }
}

/// Serves canned responses. Unknown URLs fail with a network error.
#[derive(Default)]
pub struct MemoryFetcher {
    responses: RwLock<HashMap<String, Vec<u8>>>,
    requested: RwLock<Vec<String>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.responses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.into(), body.into());
    }

    /// Every URL fetched so far, in order, including failed ones.
    pub fn requested(&self) -> Vec<String> {
        self.requested.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PluginFetcher for MemoryFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedResource> {
        self.requested
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.to_string());
        let responses = self.responses.read().unwrap_or_else(|e| e.into_inner());
        let body = responses
            .get(url)
            .cloned()
            .ok_or_else(|| PluginHostError::Network(format!("HTTP 404 fetching {url}")))?;
        Ok(FetchedResource {
            url: url.to_string(),
            content_type: None,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_fetcher_serves_known_urls() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("https://registry.test/a.json", b"{\"ok\":true}".to_vec());

        let hit = fetcher.fetch("https://registry.test/a.json").await.unwrap();
        assert_eq!(hit.json().unwrap()["ok"], true);

        let miss = fetcher.fetch("https://registry.test/b.json").await;
        assert!(matches!(miss, Err(e) if e.is_retryable()));
    }

    #[tokio::test]
    async fn http_fetcher_rejects_other_schemes() {
        let fetcher = HttpFetcher::new().unwrap();
        assert!(fetcher.fetch("file:///etc/passwd").await.is_err());
    }
}
