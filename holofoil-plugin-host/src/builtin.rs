//! Plugins compiled into the host.
//!
//! Builtins are ordinary plugins with a fixed manifest and, where they need
//! behaviour, a native worker. They run in sandboxes like every other plugin
//! and are subject to the same capability checks.

use crate::error::Result;
use crate::loader::PluginLoader;
use crate::sandbox::NativeWorkerCtor;
use holofoil_plugin_sdk::{ApiRequest, CardSummary, PluginWorker, WorkerContext, WorkerError};
use holofoil_types::{PluginId, PluginManifest};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

pub const BUILTIN_THEME_IDS: &[&str] = &["builtin.holo-dark", "builtin.classic-light"];
pub const BUILTIN_MECHANIC_IDS: &[&str] = &["builtin.memory-match"];
pub const BUILTIN_SOURCE_IDS: &[&str] = &["builtin.sample-binder"];
pub const BUILTIN_PLUGIN_IDS: &[&str] = &[
    "builtin.holo-dark",
    "builtin.classic-light",
    "builtin.memory-match",
    "builtin.sample-binder",
];

/// Pairs dealt by memory match when the caller does not ask for a count.
const DEFAULT_PAIRS: usize = 6;

pub struct BuiltinPlugin {
    pub manifest: PluginManifest,
    pub worker: Option<NativeWorkerCtor>,
}

/// Manifests and workers of every builtin plugin.
pub fn builtin_plugins() -> Result<Vec<BuiltinPlugin>> {
    let holo_dark = manifest(json!({
        "id": "builtin.holo-dark",
        "name": "Holo Dark",
        "version": "1.0.0",
        "description": "Dark theme with a holographic accent.",
        "tier": "builtin",
        "entry_points": {
            "theme": {
                "name": "Holo Dark",
                "variables": {
                    "background": "#101218",
                    "surface": "#1b1f2a",
                    "text": "#e8ecf4",
                    "accent": "#8be9fd"
                }
            }
        }
    }))?;
    let classic_light = manifest(json!({
        "id": "builtin.classic-light",
        "name": "Classic Light",
        "version": "1.0.0",
        "description": "Plain light theme.",
        "tier": "builtin",
        "entry_points": {
            "theme": {
                "name": "Classic Light",
                "variables": {
                    "background": "#fafafa",
                    "surface": "#ffffff",
                    "text": "#1d1d1f",
                    "accent": "#c0392b"
                }
            }
        }
    }))?;
    let memory_match = manifest(json!({
        "id": "builtin.memory-match",
        "name": "Memory Match",
        "version": "1.0.0",
        "description": "Flip cards from your collection and find the pairs.",
        "tier": "builtin",
        "capabilities": ["collection-read", "storage"],
        "entry_points": {
            "mechanic": {
                "id": "memory-match",
                "name": "Memory Match",
                "description": "Find matching pairs.",
                "min_cards": 2
            }
        }
    }))?;
    let sample_binder = manifest(json!({
        "id": "builtin.sample-binder",
        "name": "Sample Binder",
        "version": "1.0.0",
        "description": "A small demo collection.",
        "tier": "builtin",
        "entry_points": {
            "source": {
                "id": "sample-binder",
                "name": "Sample Binder",
                "description": "Cards to try the viewer with."
            }
        }
    }))?;

    Ok(vec![
        BuiltinPlugin { manifest: holo_dark, worker: None },
        BuiltinPlugin { manifest: classic_light, worker: None },
        BuiltinPlugin {
            manifest: memory_match,
            worker: Some(Arc::new(|_: &PluginManifest| Box::new(MemoryMatchWorker::default()) as Box<dyn PluginWorker>)),
        },
        BuiltinPlugin {
            manifest: sample_binder,
            worker: Some(Arc::new(|_: &PluginManifest| Box::new(SampleBinderWorker) as Box<dyn PluginWorker>)),
        },
    ])
}

/// Registers every builtin with `loader`. Call before [`PluginLoader::init`].
pub async fn register_all_builtin_plugins(loader: &PluginLoader) -> Result<Vec<PluginId>> {
    let mut registered = Vec::new();
    for plugin in builtin_plugins()? {
        registered.push(loader.register_builtin_plugin(plugin.manifest, plugin.worker).await?);
    }
    info!(count = registered.len(), "builtin plugins registered");
    Ok(registered)
}

fn manifest(raw: Value) -> Result<PluginManifest> {
    Ok(serde_json::from_value(raw)?)
}

/// Deals pairs of cards from the host collection. The best score is kept in
/// plugin storage.
#[derive(Default)]
struct MemoryMatchWorker {
    best: Option<u64>,
}

impl MemoryMatchWorker {
    fn deal(&self, params: &Value, ctx: &mut WorkerContext) -> std::result::Result<Value, WorkerError> {
        let pairs = params
            .get("pairs")
            .and_then(Value::as_u64)
            .map(|p| p as usize)
            .unwrap_or(DEFAULT_PAIRS);
        let listed = ctx.call_api(ApiRequest::CollectionList {
            offset: 0,
            limit: Some(pairs),
        })?;
        let cards: Vec<CardSummary> =
            serde_json::from_value(listed).map_err(|e| WorkerError::internal(e.to_string()))?;
        if cards.len() < 2 {
            return Err(WorkerError::invalid_params("memory match needs at least 2 cards"));
        }
        let mut deck: Vec<&str> = cards.iter().flat_map(|c| [c.id.as_str(), c.id.as_str()]).collect();
        // Deterministic interleave; the frontend shuffles.
        deck.rotate_left(1);
        Ok(json!({ "pairs": cards.len(), "deck": deck }))
    }

    fn record(&mut self, params: &Value, ctx: &mut WorkerContext) -> std::result::Result<Value, WorkerError> {
        let moves = params
            .get("moves")
            .and_then(Value::as_u64)
            .ok_or_else(|| WorkerError::invalid_params("missing integer 'moves'"))?;
        let improved = self.best.is_none_or(|best| moves < best);
        if improved {
            self.best = Some(moves);
            ctx.call_api(ApiRequest::StorageSet {
                key: "best".into(),
                value: json!(moves),
            })?;
            ctx.emit("memory-match.best", json!({ "moves": moves }));
        }
        Ok(json!({ "best": self.best, "improved": improved }))
    }
}

impl PluginWorker for MemoryMatchWorker {
    fn init(&mut self, ctx: &mut WorkerContext) -> std::result::Result<(), WorkerError> {
        if ctx.has_capability("storage") {
            self.best = ctx.call_api(ApiRequest::StorageGet { key: "best".into() })?.as_u64();
        }
        Ok(())
    }

    fn handle(
        &mut self,
        method: &str,
        params: Value,
        ctx: &mut WorkerContext,
    ) -> std::result::Result<Value, WorkerError> {
        match method {
            "deal" => self.deal(&params, ctx),
            "record" => self.record(&params, ctx),
            "best" => Ok(json!(self.best)),
            other => Err(WorkerError::unknown_method(other)),
        }
    }
}

/// Serves a fixed collection for the sample source.
struct SampleBinderWorker;

fn sample_cards() -> Vec<CardSummary> {
    [
        ("sb-001", "Emberling", "Starter", "common"),
        ("sb-002", "Tidecaller", "Starter", "common"),
        ("sb-003", "Gale Sprite", "Starter", "uncommon"),
        ("sb-004", "Stonewarden", "Starter", "uncommon"),
        ("sb-005", "Prism Drake", "Foil Promo", "rare"),
        ("sb-006", "Aurora Lynx", "Foil Promo", "holo-rare"),
    ]
    .into_iter()
    .map(|(id, name, set, rarity)| CardSummary {
        id: id.into(),
        name: name.into(),
        set: set.into(),
        rarity: rarity.into(),
        tags: Vec::new(),
    })
    .collect()
}

impl PluginWorker for SampleBinderWorker {
    fn handle(
        &mut self,
        method: &str,
        _params: Value,
        _ctx: &mut WorkerContext,
    ) -> std::result::Result<Value, WorkerError> {
        match method {
            "source.load" => serde_json::to_value(sample_cards()).map_err(|e| WorkerError::internal(e.to_string())),
            other => Err(WorkerError::unknown_method(other)),
        }
    }
}
