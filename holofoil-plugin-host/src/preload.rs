//! Preload scheduling: which discovered plugins to advance to `ready` ahead
//! of need, and the queue they wait in.

use holofoil_types::PluginId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::PreloadConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreloadStrategy {
    /// Everything loads lazily.
    None,
    /// Plugins that were active when the host last shut down.
    #[default]
    LastActive,
    /// Builtin plugins plus last-active ones.
    Builtins,
    /// Every discovered plugin.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadOptions {
    pub strategy: PreloadStrategy,
    /// Preloads running at once. Zero disables preloading.
    pub max_concurrent: usize,
}

impl Default for PreloadOptions {
    fn default() -> Self {
        Self::from(&PreloadConfig::default())
    }
}

impl From<&PreloadConfig> for PreloadOptions {
    fn from(config: &PreloadConfig) -> Self {
        Self {
            strategy: config.strategy,
            max_concurrent: config.max_concurrent,
        }
    }
}

/// What the scheduler knows about a discovered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadCandidate {
    pub plugin_id: PluginId,
    pub builtin: bool,
    pub last_active: bool,
}

/// Picks the candidates `strategy` wants preloaded. Last-active plugins go
/// first, then builtins, then the rest, each group in id order.
pub fn select_preload_candidates(strategy: PreloadStrategy, candidates: &[PreloadCandidate]) -> Vec<PluginId> {
    let mut picked: Vec<&PreloadCandidate> = candidates
        .iter()
        .filter(|c| match strategy {
            PreloadStrategy::None => false,
            PreloadStrategy::LastActive => c.last_active,
            PreloadStrategy::Builtins => c.last_active || c.builtin,
            PreloadStrategy::All => true,
        })
        .collect();
    picked.sort_by(|a, b| {
        (!a.last_active, !a.builtin, &a.plugin_id).cmp(&(!b.last_active, !b.builtin, &b.plugin_id))
    });
    picked.dedup_by(|a, b| a.plugin_id == b.plugin_id);
    picked.into_iter().map(|c| c.plugin_id.clone()).collect()
}

/// FIFO of plugins waiting to be preloaded. Each id appears at most once.
#[derive(Default)]
pub struct PreloadQueue {
    queue: Mutex<VecDeque<PluginId>>,
}

impl PreloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the id was already queued.
    pub fn push(&self, plugin_id: PluginId) -> bool {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.contains(&plugin_id) {
            return false;
        }
        queue.push_back(plugin_id);
        true
    }

    pub fn pop(&self) -> Option<PluginId> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    pub fn remove(&self, plugin_id: &PluginId) -> bool {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let before = queue.len();
        queue.retain(|id| id != plugin_id);
        queue.len() != before
    }

    pub fn contains(&self, plugin_id: &PluginId) -> bool {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).contains(plugin_id)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, builtin: bool, last_active: bool) -> PreloadCandidate {
        PreloadCandidate {
            plugin_id: PluginId::parse(id).unwrap(),
            builtin,
            last_active,
        }
    }

    fn ids(v: Vec<PluginId>) -> Vec<String> {
        v.into_iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn strategies_pick_expected_plugins() {
        let all = [
            candidate("community.zeta", false, false),
            candidate("builtin.dark", true, false),
            candidate("community.alpha", false, true),
        ];
        assert!(select_preload_candidates(PreloadStrategy::None, &all).is_empty());
        assert_eq!(ids(select_preload_candidates(PreloadStrategy::LastActive, &all)), ["community.alpha"]);
        assert_eq!(
            ids(select_preload_candidates(PreloadStrategy::Builtins, &all)),
            ["community.alpha", "builtin.dark"]
        );
        assert_eq!(
            ids(select_preload_candidates(PreloadStrategy::All, &all)),
            ["community.alpha", "builtin.dark", "community.zeta"]
        );
    }

    #[test]
    fn queue_dedups_and_removes() {
        let q = PreloadQueue::new();
        let a = PluginId::parse("a").unwrap();
        let b = PluginId::parse("b").unwrap();
        assert!(q.push(a.clone()));
        assert!(!q.push(a.clone()));
        q.push(b.clone());
        assert!(q.remove(&a));
        assert!(!q.contains(&a));
        assert_eq!(q.pop(), Some(b));
        assert!(q.is_empty());
    }
}
