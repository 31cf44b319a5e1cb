//! Source adapter: collection data sources contributed by plugins.
//!
//! The adapter only keeps the registry. Fetching is delegated to a
//! [`CollectionFetcher`] so the host's networking layer, not the plugin,
//! talks to the endpoint.

use crate::error::{PluginHostError, Result};
use crate::fetch::PluginFetcher;
use crate::sandbox::LiveSandboxes;
use async_trait::async_trait;
use holofoil_plugin_sdk::CardSummary;
use holofoil_types::{PluginId, PluginManifest, SourceEntry};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginSource {
    /// `{plugin}/{source}`, unique across plugins.
    pub source_id: String,
    pub plugin_id: PluginId,
    pub entry: SourceEntry,
}

#[async_trait]
pub trait CollectionFetcher: Send + Sync {
    async fn fetch_collection(&self, source: &PluginSource) -> Result<Vec<CardSummary>>;
}

/// Fetches a JSON array of cards from the source's endpoint.
pub struct EndpointCollectionFetcher {
    fetcher: Arc<dyn PluginFetcher>,
}

impl EndpointCollectionFetcher {
    pub fn new(fetcher: Arc<dyn PluginFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl CollectionFetcher for EndpointCollectionFetcher {
    async fn fetch_collection(&self, source: &PluginSource) -> Result<Vec<CardSummary>> {
        let endpoint = source.entry.endpoint.as_deref().ok_or_else(|| {
            PluginHostError::Config(format!("source '{}' has no endpoint", source.source_id))
        })?;
        let resource = self.fetcher.fetch(endpoint).await?;
        Ok(serde_json::from_slice(&resource.body)?)
    }
}

/// Fetches from the endpoint when the source declares one, otherwise asks
/// the plugin's own worker through its `source.load` method.
pub struct PluginCollectionFetcher {
    endpoint: EndpointCollectionFetcher,
    sandboxes: Arc<LiveSandboxes>,
}

impl PluginCollectionFetcher {
    pub fn new(fetcher: Arc<dyn PluginFetcher>, sandboxes: Arc<LiveSandboxes>) -> Self {
        Self {
            endpoint: EndpointCollectionFetcher::new(fetcher),
            sandboxes,
        }
    }
}

#[async_trait]
impl CollectionFetcher for PluginCollectionFetcher {
    async fn fetch_collection(&self, source: &PluginSource) -> Result<Vec<CardSummary>> {
        if source.entry.endpoint.is_some() {
            return self.endpoint.fetch_collection(source).await;
        }
        let sandbox = self
            .sandboxes
            .get(&source.plugin_id)
            .ok_or_else(|| PluginHostError::SandboxTerminated(source.plugin_id.to_string()))?;
        let cards = sandbox
            .request("source.load", json!({ "source": source.entry.id }))
            .await?;
        Ok(serde_json::from_value(cards)?)
    }
}

pub struct SourceAdapter {
    sources: RwLock<BTreeMap<String, PluginSource>>,
    fetcher: Arc<dyn CollectionFetcher>,
}

impl SourceAdapter {
    pub fn new(fetcher: Arc<dyn CollectionFetcher>) -> Self {
        Self {
            sources: RwLock::new(BTreeMap::new()),
            fetcher,
        }
    }

    pub fn register_source_from_plugin(&self, plugin_id: &PluginId, manifest: &PluginManifest) -> bool {
        let Some(entry) = &manifest.entry_points.source else {
            return false;
        };
        let source = PluginSource {
            source_id: format!("{plugin_id}/{}", entry.id),
            plugin_id: plugin_id.clone(),
            entry: entry.clone(),
        };
        self.sources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source.source_id.clone(), source);
        true
    }

    pub fn unregister_sources_from_plugin(&self, plugin_id: &PluginId) -> usize {
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        let before = sources.len();
        sources.retain(|_, s| s.plugin_id != *plugin_id);
        before - sources.len()
    }

    pub fn get_available_sources(&self) -> Vec<PluginSource> {
        self.sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub async fn load_collection_from_source(&self, source_id: &str) -> Result<Vec<CardSummary>> {
        let source = self
            .sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(source_id)
            .cloned()
            .ok_or_else(|| PluginHostError::UnknownSource(source_id.to_string()))?;
        let cards = self.fetcher.fetch_collection(&source).await?;
        info!(source_id = %source_id, cards = cards.len(), "loaded collection from source");
        Ok(cards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetcher;

    #[tokio::test]
    async fn loads_through_the_endpoint_fetcher() {
        let http = Arc::new(MemoryFetcher::new());
        http.insert(
            "https://cards.test/export.json",
            serde_json::to_vec(&json!([{ "id": "c1", "name": "Pikachu" }])).unwrap(),
        );
        let adapter = SourceAdapter::new(Arc::new(EndpointCollectionFetcher::new(http)));
        let manifest: PluginManifest = serde_json::from_value(json!({
            "id": "curated.export",
            "name": "Export",
            "version": "1.0.0",
            "entry_points": { "source": {
                "id": "main", "name": "Export", "endpoint": "https://cards.test/export.json"
            } }
        }))
        .unwrap();

        assert!(adapter.register_source_from_plugin(&manifest.id, &manifest));
        let cards = adapter.load_collection_from_source("curated.export/main").await.unwrap();
        assert_eq!(cards[0].name, "Pikachu");

        assert_eq!(adapter.unregister_sources_from_plugin(&manifest.id), 1);
        assert!(matches!(
            adapter.load_collection_from_source("curated.export/main").await,
            Err(PluginHostError::UnknownSource(_))
        ));
    }
}
