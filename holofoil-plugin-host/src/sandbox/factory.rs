//! Produces the worker that runs inside a plugin's sandbox.

use crate::error::Result;
use holofoil_plugin_sdk::{ApiRequest, PluginWorker, WorkerContext, WorkerError};
use holofoil_types::{PluginId, PluginManifest};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub trait WorkerFactory: Send + Sync {
    fn create_worker(&self, manifest: &PluginManifest) -> Result<Box<dyn PluginWorker>>;
}

pub type NativeWorkerCtor = Arc<dyn Fn(&PluginManifest) -> Box<dyn PluginWorker> + Send + Sync>;

/// Native workers by plugin id. Plugins without one get a
/// [`DeclarativeWorker`].
#[derive(Default)]
pub struct WorkerRegistry {
    natives: RwLock<HashMap<PluginId, NativeWorkerCtor>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_native<F>(&self, plugin_id: PluginId, ctor: F)
    where
        F: Fn(&PluginManifest) -> Box<dyn PluginWorker> + Send + Sync + 'static,
    {
        self.natives
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(plugin_id, Arc::new(ctor));
    }

    pub fn unregister_native(&self, plugin_id: &PluginId) -> bool {
        self.natives
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plugin_id)
            .is_some()
    }

    pub fn has_native(&self, plugin_id: &PluginId) -> bool {
        self.natives
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(plugin_id)
    }
}

impl WorkerFactory for WorkerRegistry {
    fn create_worker(&self, manifest: &PluginManifest) -> Result<Box<dyn PluginWorker>> {
        let ctor = self
            .natives
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&manifest.id)
            .cloned();
        Ok(match ctor {
            Some(ctor) => ctor(manifest),
            None => Box::new(DeclarativeWorker::new(manifest.clone())),
        })
    }
}

/// Serves a plugin's declared entry points without running any plugin code.
pub struct DeclarativeWorker {
    manifest: PluginManifest,
}

impl DeclarativeWorker {
    pub fn new(manifest: PluginManifest) -> Self {
        Self { manifest }
    }

    fn entry(&self, kind: &str) -> std::result::Result<Value, WorkerError> {
        let entries = &self.manifest.entry_points;
        let value = match kind {
            "theme" => serde_json::to_value(&entries.theme),
            "mechanic" => serde_json::to_value(&entries.mechanic),
            "settings" => serde_json::to_value(&entries.settings),
            "source" => serde_json::to_value(&entries.source),
            other => return Err(WorkerError::invalid_params(format!("unknown entry point '{other}'"))),
        };
        value.map_err(|e| WorkerError::internal(e.to_string()))
    }
}

impl PluginWorker for DeclarativeWorker {
    fn handle(
        &mut self,
        method: &str,
        params: Value,
        ctx: &mut WorkerContext,
    ) -> std::result::Result<Value, WorkerError> {
        match method {
            "ping" => Ok(json!("pong")),
            "describe" => Ok(json!({
                "id": self.manifest.id,
                "name": self.manifest.name,
                "version": self.manifest.version,
                "entry_points": self.manifest.entry_point_kinds(),
            })),
            "entry" => {
                let kind = string_param(&params, "kind")?;
                self.entry(&kind)
            }
            "setting" => {
                let key = string_param(&params, "key")?;
                ctx.call_api(ApiRequest::SettingsGet { key })
            }
            other => Err(WorkerError::unknown_method(other)),
        }
    }
}

fn string_param(params: &Value, name: &str) -> std::result::Result<String, WorkerError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| WorkerError::invalid_params(format!("missing string '{name}'")))
}
