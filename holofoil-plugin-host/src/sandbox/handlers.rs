//! Host API handlers exposed to workers.
//!
//! Each API is gated on exactly one capability; [`PluginApiHandlers::dispatch`]
//! routes by capability with an exhaustive match. Gate checks happen in the
//! bridge before a handler runs.

use super::bridge::WorkerSandbox;
use crate::adapters::SettingsAdapter;
use crate::capabilities::{self, Capability};
use crate::error::PluginHostError;
use crate::fetch::PluginFetcher;
use async_trait::async_trait;
use holofoil_plugin_sdk::{ApiRequest, CardSummary, ErrorTag, NotificationLevel, WorkerError};
use holofoil_storage::PluginStorage;
use holofoil_types::{PluginId, TrustTier};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Cards returned by one `collection.list` call at most.
pub const MAX_LIST_PAGE: usize = 500;

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn notify(
        &self,
        plugin_id: &PluginId,
        title: &str,
        body: &str,
        level: NotificationLevel,
    ) -> Result<(), PluginHostError>;
}

#[async_trait]
pub trait ModalHandler: Send + Sync {
    /// Shows a dialog and returns the label of the button pressed, if any.
    async fn show_modal(
        &self,
        plugin_id: &PluginId,
        title: &str,
        body: &str,
        buttons: &[String],
    ) -> Result<Option<String>, PluginHostError>;
}

/// Read/write access to the user's collection. Every method returns copies.
#[async_trait]
pub trait CollectionProvider: Send + Sync {
    async fn list_cards(&self, offset: usize, limit: usize) -> Result<Vec<CardSummary>, PluginHostError>;
    async fn get_card(&self, card_id: &str) -> Result<Option<CardSummary>, PluginHostError>;
    /// Adds a tag. Returns `false` if the card does not exist.
    async fn tag_card(&self, card_id: &str, tag: &str) -> Result<bool, PluginHostError>;
}

/// Who is calling.
#[derive(Debug, Clone)]
pub struct ApiCaller {
    pub plugin_id: PluginId,
    pub tier: TrustTier,
}

/// Services the handlers are built from.
#[derive(Clone, Default)]
pub struct HandlerServices {
    pub storage: Option<Arc<PluginStorage>>,
    pub settings: Option<Arc<SettingsAdapter>>,
    pub fetcher: Option<Arc<dyn PluginFetcher>>,
}

pub struct PluginApiHandlers {
    services: HandlerServices,
    notification: RwLock<Option<Arc<dyn NotificationHandler>>>,
    modal: RwLock<Option<Arc<dyn ModalHandler>>>,
    collection: RwLock<Option<Arc<dyn CollectionProvider>>>,
}

pub fn create_plugin_api_handlers(services: HandlerServices) -> Arc<PluginApiHandlers> {
    Arc::new(PluginApiHandlers {
        services,
        notification: RwLock::new(None),
        modal: RwLock::new(None),
        collection: RwLock::new(None),
    })
}

/// Wires `handlers` into a sandbox for the granted capabilities only.
/// Returns the capabilities that still lack a backing handler; calls to
/// them fail with `handler-unavailable` until one is set.
pub fn register_sandbox_api_handlers(
    sandbox: &WorkerSandbox,
    handlers: &Arc<PluginApiHandlers>,
    granted: &BTreeSet<Capability>,
) -> BTreeSet<Capability> {
    sandbox.install_handlers(Arc::clone(handlers), granted.clone());
    let missing: BTreeSet<Capability> = granted
        .iter()
        .copied()
        .filter(|c| !handlers.provides(*c))
        .collect();
    debug!(
        plugin_id = %sandbox.plugin_id(),
        installed = granted.len(),
        missing = missing.len(),
        "registered sandbox api handlers"
    );
    missing
}

impl PluginApiHandlers {
    pub fn set_notification_handler(&self, handler: Arc<dyn NotificationHandler>) {
        *self.notification.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn set_modal_handler(&self, handler: Arc<dyn ModalHandler>) {
        *self.modal.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn set_collection_provider(&self, provider: Arc<dyn CollectionProvider>) {
        *self.collection.write().unwrap_or_else(|e| e.into_inner()) = Some(provider);
    }

    /// Whether a handler backing `capability` is present.
    pub fn provides(&self, capability: Capability) -> bool {
        match capability {
            Capability::Storage => self.services.storage.is_some(),
            Capability::SettingsRead | Capability::SettingsWrite => self.services.settings.is_some(),
            Capability::Network => self.services.fetcher.is_some(),
            Capability::Notification => self.notification_handler().is_some(),
            Capability::UiModal => self.modal_handler().is_some(),
            Capability::CollectionRead | Capability::CollectionWrite => {
                self.collection_provider().is_some()
            }
        }
    }

    pub async fn dispatch(&self, caller: &ApiCaller, request: ApiRequest) -> Result<Value, WorkerError> {
        match Capability::for_api(&request) {
            Capability::Storage => self.storage(caller, request).await,
            Capability::Notification => self.notification(caller, request).await,
            Capability::SettingsRead => self.settings_read(caller, request),
            Capability::SettingsWrite => self.settings_write(caller, request),
            Capability::UiModal => self.modal(caller, request).await,
            Capability::CollectionRead => self.collection_read(request).await,
            Capability::CollectionWrite => self.collection_write(request).await,
            Capability::Network => self.network(request).await,
        }
    }

    // ── Handlers ─────────────────────────────────────────────────

    async fn storage(&self, caller: &ApiCaller, request: ApiRequest) -> Result<Value, WorkerError> {
        let storage = self.services.storage.as_ref().ok_or_else(|| unavailable(Capability::Storage))?;
        let id = &caller.plugin_id;
        match request {
            ApiRequest::StorageGet { key } => Ok(storage
                .get(id, &key)
                .await
                .map_err(storage_error)?
                .unwrap_or(Value::Null)),
            ApiRequest::StorageSet { key, value } => {
                let limit = capabilities::get_tier_limits(caller.tier).max_cache_bytes;
                storage
                    .set(id, &key, &value, Some(limit))
                    .await
                    .map_err(storage_error)?;
                Ok(Value::Null)
            }
            ApiRequest::StorageRemove { key } => Ok(Value::Bool(
                storage.remove(id, &key).await.map_err(storage_error)?,
            )),
            other => Err(misrouted(&other)),
        }
    }

    async fn notification(&self, caller: &ApiCaller, request: ApiRequest) -> Result<Value, WorkerError> {
        let ApiRequest::Notify { title, body, level } = request else {
            return Err(misrouted(&request));
        };
        let handler = self
            .notification_handler()
            .ok_or_else(|| unavailable(Capability::Notification))?;
        handler
            .notify(&caller.plugin_id, &title, &body, level)
            .await
            .map_err(host_error)?;
        Ok(Value::Null)
    }

    fn settings_read(&self, caller: &ApiCaller, request: ApiRequest) -> Result<Value, WorkerError> {
        let ApiRequest::SettingsGet { key } = request else {
            return Err(misrouted(&request));
        };
        let settings = self
            .services
            .settings
            .as_ref()
            .ok_or_else(|| unavailable(Capability::SettingsRead))?;
        settings
            .get_plugin_setting_value(&caller.plugin_id, &key)
            .map_err(host_error)
    }

    fn settings_write(&self, caller: &ApiCaller, request: ApiRequest) -> Result<Value, WorkerError> {
        let ApiRequest::SettingsSet { key, value } = request else {
            return Err(misrouted(&request));
        };
        let settings = self
            .services
            .settings
            .as_ref()
            .ok_or_else(|| unavailable(Capability::SettingsWrite))?;
        settings
            .set_plugin_setting_value(&caller.plugin_id, &key, value)
            .map_err(host_error)?;
        Ok(Value::Null)
    }

    async fn modal(&self, caller: &ApiCaller, request: ApiRequest) -> Result<Value, WorkerError> {
        let ApiRequest::Modal { title, body, buttons } = request else {
            return Err(misrouted(&request));
        };
        let handler = self.modal_handler().ok_or_else(|| unavailable(Capability::UiModal))?;
        let pressed = handler
            .show_modal(&caller.plugin_id, &title, &body, &buttons)
            .await
            .map_err(host_error)?;
        Ok(json!({ "button": pressed }))
    }

    async fn collection_read(&self, request: ApiRequest) -> Result<Value, WorkerError> {
        let provider = self
            .collection_provider()
            .ok_or_else(|| unavailable(Capability::CollectionRead))?;
        match request {
            ApiRequest::CollectionList { offset, limit } => {
                let limit = limit.unwrap_or(MAX_LIST_PAGE).min(MAX_LIST_PAGE);
                let cards = provider.list_cards(offset, limit).await.map_err(host_error)?;
                serde_json::to_value(cards).map_err(|e| WorkerError::internal(e.to_string()))
            }
            ApiRequest::CollectionGet { card_id } => {
                let card = provider.get_card(&card_id).await.map_err(host_error)?;
                serde_json::to_value(card).map_err(|e| WorkerError::internal(e.to_string()))
            }
            other => Err(misrouted(&other)),
        }
    }

    async fn collection_write(&self, request: ApiRequest) -> Result<Value, WorkerError> {
        let ApiRequest::CollectionTag { card_id, tag } = request else {
            return Err(misrouted(&request));
        };
        let provider = self
            .collection_provider()
            .ok_or_else(|| unavailable(Capability::CollectionWrite))?;
        let tagged = provider.tag_card(&card_id, &tag).await.map_err(host_error)?;
        Ok(Value::Bool(tagged))
    }

    async fn network(&self, request: ApiRequest) -> Result<Value, WorkerError> {
        let ApiRequest::HttpGet { url } = request else {
            return Err(misrouted(&request));
        };
        let fetcher = self
            .services
            .fetcher
            .as_ref()
            .ok_or_else(|| unavailable(Capability::Network))?;
        let resource = fetcher.fetch(&url).await.map_err(host_error)?;
        Ok(json!({
            "url": resource.url,
            "content_type": resource.content_type,
            "body": resource.text(),
        }))
    }

    fn notification_handler(&self) -> Option<Arc<dyn NotificationHandler>> {
        self.notification.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn modal_handler(&self) -> Option<Arc<dyn ModalHandler>> {
        self.modal.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn collection_provider(&self) -> Option<Arc<dyn CollectionProvider>> {
        self.collection.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn unavailable(capability: Capability) -> WorkerError {
    WorkerError::new(
        ErrorTag::HandlerUnavailable,
        format!("no handler for '{capability}'"),
    )
}

fn misrouted(request: &ApiRequest) -> WorkerError {
    WorkerError::internal(format!("'{}' routed to the wrong handler", request.name()))
}

fn storage_error(e: holofoil_storage::StorageError) -> WorkerError {
    match e {
        holofoil_storage::StorageError::InvalidKey(msg) => WorkerError::invalid_params(msg),
        holofoil_storage::StorageError::QuotaExceeded { .. } => WorkerError::invalid_params(e.to_string()),
        other => WorkerError::internal(other.to_string()),
    }
}

fn host_error(e: PluginHostError) -> WorkerError {
    match e {
        PluginHostError::InvalidSetting { .. } => WorkerError::invalid_params(e.to_string()),
        PluginHostError::Network(msg) => WorkerError::new(ErrorTag::Unavailable, msg),
        other => WorkerError::internal(other.user_message()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holofoil_storage::MemoryKvStore;

    fn caller() -> ApiCaller {
        ApiCaller {
            plugin_id: PluginId::parse("community.notes").unwrap(),
            tier: TrustTier::Community,
        }
    }

    #[tokio::test]
    async fn storage_round_trip_is_plugin_scoped() {
        let storage = Arc::new(PluginStorage::new(Arc::new(MemoryKvStore::new())));
        let handlers = create_plugin_api_handlers(HandlerServices {
            storage: Some(storage.clone()),
            ..Default::default()
        });
        let me = caller();

        handlers
            .dispatch(&me, ApiRequest::StorageSet { key: "k".into(), value: json!([1, 2]) })
            .await
            .unwrap();
        let got = handlers
            .dispatch(&me, ApiRequest::StorageGet { key: "k".into() })
            .await
            .unwrap();
        assert_eq!(got, json!([1, 2]));

        let other = PluginId::parse("community.other").unwrap();
        assert_eq!(storage.get(&other, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_handler_is_reported() {
        let handlers = create_plugin_api_handlers(HandlerServices::default());
        assert!(!handlers.provides(Capability::Notification));
        let err = handlers
            .dispatch(
                &caller(),
                ApiRequest::Notify { title: "t".into(), body: String::new(), level: NotificationLevel::Info },
            )
            .await
            .unwrap_err();
        assert_eq!(err.tag, ErrorTag::HandlerUnavailable);
    }
}
