//! Shared fixtures for the host integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use holofoil_plugin_host::PluginHostError;
use holofoil_plugin_host::sandbox::CollectionProvider;
use holofoil_plugin_sdk::{ApiRequest, CardSummary, PluginWorker, WorkerContext, WorkerError};
use holofoil_types::PluginId;
use serde_json::{Value, json};
use std::sync::Mutex;
use std::time::Duration;

pub fn pid(s: &str) -> PluginId {
    PluginId::parse(s).unwrap()
}

/// Worker whose methods exercise every part of the bridge.
pub struct Probe;

impl PluginWorker for Probe {
    fn handle(&mut self, method: &str, params: Value, ctx: &mut WorkerContext) -> Result<Value, WorkerError> {
        match method {
            "echo" => Ok(params),
            "sleep" => {
                let ms = params["ms"].as_u64().unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                Ok(params)
            }
            "emit" => {
                ctx.emit("probe.event", params);
                Ok(Value::Null)
            }
            "store" => ctx.call_api(ApiRequest::StorageSet {
                key: "k".into(),
                value: params,
            }),
            "load" => ctx.call_api(ApiRequest::StorageGet { key: "k".into() }),
            "list" => ctx.call_api(ApiRequest::CollectionList { offset: 0, limit: None }),
            "tag" => ctx.call_api(ApiRequest::CollectionTag {
                card_id: "c1".into(),
                tag: "fav".into(),
            }),
            "config" => Ok(ctx.config().clone()),
            "panic" => panic!("probe asked to panic"),
            other => Err(WorkerError::unknown_method(other)),
        }
    }
}

/// Worker whose `init` always fails.
pub struct BrokenInit;

impl PluginWorker for BrokenInit {
    fn init(&mut self, _ctx: &mut WorkerContext) -> Result<(), WorkerError> {
        Err(WorkerError::internal("missing resource"))
    }

    fn handle(&mut self, _: &str, _: Value, _: &mut WorkerContext) -> Result<Value, WorkerError> {
        Ok(Value::Null)
    }
}

/// In-memory collection.
pub struct Binder {
    cards: Mutex<Vec<CardSummary>>,
}

impl Binder {
    pub fn with_cards(n: usize) -> Self {
        let cards = (1..=n)
            .map(|i| CardSummary {
                id: format!("c{i}"),
                name: format!("Card {i}"),
                set: "Base".into(),
                rarity: "common".into(),
                tags: Vec::new(),
            })
            .collect();
        Self { cards: Mutex::new(cards) }
    }
}

#[async_trait]
impl CollectionProvider for Binder {
    async fn list_cards(&self, offset: usize, limit: usize) -> Result<Vec<CardSummary>, PluginHostError> {
        Ok(self.cards.lock().unwrap().iter().skip(offset).take(limit).cloned().collect())
    }

    async fn get_card(&self, card_id: &str) -> Result<Option<CardSummary>, PluginHostError> {
        Ok(self.cards.lock().unwrap().iter().find(|c| c.id == card_id).cloned())
    }

    async fn tag_card(&self, card_id: &str, tag: &str) -> Result<bool, PluginHostError> {
        let mut cards = self.cards.lock().unwrap();
        match cards.iter_mut().find(|c| c.id == card_id) {
            Some(card) => {
                card.tags.push(tag.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

pub fn manifest_json(id: &str, capabilities: &[&str]) -> Value {
    json!({
        "id": id,
        "name": id,
        "version": "1.0.0",
        "capabilities": capabilities,
        "entry_points": { "mechanic": { "id": "probe", "name": "Probe" } }
    })
}
