//! Permission manager.
//!
//! Tracks one grant state per `(plugin, capability)` pair:
//!
//! - `unrequested` (no record) → `pending-consent` → `granted` | `denied`
//! - `granted` and `denied` are terminal until a revoke resets the pair.
//! - Tier-blocked capabilities are never recorded and never asked about.
//! - Capabilities denied by host policy go straight to `denied`.
//!
//! Consent-required capabilities are batched into a single prompt carrying
//! the plugin's validation warnings.

use crate::capabilities::{self, Capability};
use crate::error::{PluginHostError, Result};
use crate::policy::PolicyEngine;
use crate::validator::ValidationIssue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use holofoil_types::{Clock, PluginId, SystemClock, TrustTier};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrantState {
    Unrequested,
    PendingConsent,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub state: GrantState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionCheckResult {
    pub plugin_id: PluginId,
    pub capability: Capability,
    pub state: GrantState,
    /// Outside the plugin's tier; can never be granted.
    pub tier_blocked: bool,
}

impl PermissionCheckResult {
    pub fn is_granted(&self) -> bool {
        self.state == GrantState::Granted
    }

    /// `Ok(())` when granted, otherwise `PermissionDenied`.
    pub fn require(&self) -> Result<()> {
        if self.is_granted() {
            Ok(())
        } else {
            Err(PluginHostError::PermissionDenied {
                plugin_id: self.plugin_id.to_string(),
                capability: self.capability.to_string(),
            })
        }
    }
}

/// Outcome of one batch request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionRequestResult {
    pub requested: BTreeSet<Capability>,
    pub granted: BTreeSet<Capability>,
    /// Denied by the user (now or earlier).
    pub denied: BTreeSet<Capability>,
    pub policy_denied: BTreeSet<Capability>,
    pub blocked: BTreeSet<Capability>,
    /// Consent was abandoned; these are back to `unrequested`.
    pub cancelled: BTreeSet<Capability>,
    /// Another request for the same pair is still awaiting consent.
    pub pending: BTreeSet<Capability>,
}

impl PermissionRequestResult {
    /// Something was requested and every capability was refused by tier or
    /// policy, leaving nothing granted and nothing for the user to decide.
    pub fn is_fully_refused(&self) -> bool {
        !self.requested.is_empty()
            && self
                .requested
                .iter()
                .all(|c| self.blocked.contains(c) || self.policy_denied.contains(c))
    }
}

/// What the user is asked to approve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsentRequest {
    pub plugin_id: PluginId,
    pub tier: TrustTier,
    pub capabilities: Vec<Capability>,
    /// Validation warnings, shown alongside the request.
    pub warnings: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentDecision {
    /// Approve this subset; the rest of the request is denied.
    Approve(BTreeSet<Capability>),
    Deny,
    /// The prompt was dismissed without an answer.
    Cancelled,
}

/// Asks the end user for consent. Implemented by the UI layer.
#[async_trait]
pub trait ConsentPrompt: Send + Sync {
    async fn request_consent(&self, request: ConsentRequest) -> ConsentDecision;
}

/// Approves everything asked. For headless hosts and tests.
pub struct AutoApprove;

#[async_trait]
impl ConsentPrompt for AutoApprove {
    async fn request_consent(&self, request: ConsentRequest) -> ConsentDecision {
        ConsentDecision::Approve(request.capabilities.into_iter().collect())
    }
}

/// Denies everything asked.
pub struct AutoDeny;

#[async_trait]
impl ConsentPrompt for AutoDeny {
    async fn request_consent(&self, _request: ConsentRequest) -> ConsentDecision {
        ConsentDecision::Deny
    }
}

/// Serializable copy of every settled grant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSnapshot {
    pub plugins: BTreeMap<PluginId, PluginGrantSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginGrantSnapshot {
    pub tier: TrustTier,
    pub grants: BTreeMap<Capability, PermissionGrant>,
}

#[derive(Debug, Clone)]
struct PluginPermissions {
    tier: TrustTier,
    grants: BTreeMap<Capability, PermissionGrant>,
}

pub struct PermissionManager {
    plugins: RwLock<HashMap<PluginId, PluginPermissions>>,
    consent_cancel: Mutex<HashMap<PluginId, Arc<Notify>>>,
    policy: Arc<PolicyEngine>,
    prompt: Arc<dyn ConsentPrompt>,
    clock: Arc<dyn Clock>,
}

impl PermissionManager {
    pub fn new(policy: Arc<PolicyEngine>, prompt: Arc<dyn ConsentPrompt>) -> Self {
        Self::with_clock(policy, prompt, Arc::new(SystemClock))
    }

    pub fn with_clock(
        policy: Arc<PolicyEngine>,
        prompt: Arc<dyn ConsentPrompt>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            consent_cancel: Mutex::new(HashMap::new()),
            policy,
            prompt,
            clock,
        }
    }

    /// Registers a plugin at a tier. Re-registering at a lower tier drops
    /// grants the new tier no longer allows.
    pub fn register_plugin(&self, plugin: &PluginId, tier: TrustTier) {
        let mut plugins = self.write();
        let entry = plugins
            .entry(plugin.clone())
            .or_insert_with(|| PluginPermissions {
                tier,
                grants: BTreeMap::new(),
            });
        entry.tier = tier;
        let limits = capabilities::get_tier_limits(tier);
        entry.grants.retain(|cap, _| limits.allows(*cap));
    }

    pub fn is_registered(&self, plugin: &PluginId) -> bool {
        self.read().contains_key(plugin)
    }

    pub fn check_plugin_capability(&self, plugin: &PluginId, capability: Capability) -> PermissionCheckResult {
        let plugins = self.read();
        let (state, tier_blocked) = match plugins.get(plugin) {
            Some(p) => (
                p.grants
                    .get(&capability)
                    .map_or(GrantState::Unrequested, |g| g.state),
                !capabilities::get_tier_limits(p.tier).allows(capability),
            ),
            None => (GrantState::Unrequested, false),
        };
        PermissionCheckResult {
            plugin_id: plugin.clone(),
            capability,
            state,
            tier_blocked,
        }
    }

    /// Resolves a batch of capabilities, prompting once for those that need consent.
    pub async fn request_plugin_capabilities(
        &self,
        plugin: &PluginId,
        requested: &[Capability],
        warnings: Vec<ValidationIssue>,
    ) -> Result<PermissionRequestResult> {
        let mut result = PermissionRequestResult {
            requested: requested.iter().copied().collect(),
            ..Default::default()
        };

        let (tier, to_prompt) = {
            let mut plugins = self.write();
            let entry = plugins
                .get_mut(plugin)
                .ok_or_else(|| PluginHostError::PluginNotFound(plugin.to_string()))?;
            let tier = entry.tier;
            let validation = capabilities::validate_capabilities(tier, requested);
            let now = self.clock.now();
            result.blocked = validation.blocked;

            let mut to_prompt = Vec::new();
            for cap in validation.allowed.iter().chain(validation.needs_consent.iter()).copied() {
                match entry.grants.get(&cap).map(|g| g.state) {
                    Some(GrantState::Granted) => {
                        result.granted.insert(cap);
                        continue;
                    }
                    Some(GrantState::Denied) => {
                        if self.policy.is_capability_denied_by_policy(cap) {
                            result.policy_denied.insert(cap);
                        } else {
                            result.denied.insert(cap);
                        }
                        continue;
                    }
                    Some(GrantState::PendingConsent) => {
                        result.pending.insert(cap);
                        continue;
                    }
                    Some(GrantState::Unrequested) | None => {}
                }

                let state = if self.policy.is_capability_denied_by_policy(cap) {
                    result.policy_denied.insert(cap);
                    GrantState::Denied
                } else if validation.needs_consent.contains(&cap) {
                    to_prompt.push(cap);
                    GrantState::PendingConsent
                } else {
                    result.granted.insert(cap);
                    GrantState::Granted
                };
                entry.grants.insert(cap, PermissionGrant { state, updated_at: now });
            }
            (tier, to_prompt)
        };

        for cap in &result.blocked {
            debug!(plugin_id = %plugin, capability = %cap, tier = %tier, "capability blocked by tier");
        }

        if to_prompt.is_empty() {
            return Ok(result);
        }

        let cancel = {
            let mut map = self.consent_cancel.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(plugin.clone()).or_default())
        };
        let request = ConsentRequest {
            plugin_id: plugin.clone(),
            tier,
            capabilities: to_prompt.clone(),
            warnings,
        };
        let decision = tokio::select! {
            decision = self.prompt.request_consent(request) => decision,
            _ = cancel.notified() => ConsentDecision::Cancelled,
        };
        self.consent_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plugin);

        let mut plugins = self.write();
        let now = self.clock.now();
        let Some(entry) = plugins.get_mut(plugin) else {
            // Cleared while the prompt was open.
            result.cancelled.extend(to_prompt);
            return Ok(result);
        };
        for cap in to_prompt {
            if entry.grants.get(&cap).map(|g| g.state) != Some(GrantState::PendingConsent) {
                continue;
            }
            let outcome = match &decision {
                ConsentDecision::Approve(set) if set.contains(&cap) => Some(GrantState::Granted),
                ConsentDecision::Approve(_) | ConsentDecision::Deny => Some(GrantState::Denied),
                ConsentDecision::Cancelled => None,
            };
            match outcome {
                Some(state) => {
                    entry.grants.insert(cap, PermissionGrant { state, updated_at: now });
                    if state == GrantState::Granted {
                        result.granted.insert(cap);
                    } else {
                        result.denied.insert(cap);
                    }
                    info!(plugin_id = %plugin, capability = %cap, ?state, "consent decided");
                }
                None => {
                    entry.grants.remove(&cap);
                    result.cancelled.insert(cap);
                }
            }
        }
        Ok(result)
    }

    /// Grants a capability directly. Refuses tier-blocked and policy-denied ones.
    pub fn grant_plugin_capability(&self, plugin: &PluginId, capability: Capability) -> Result<()> {
        if self.policy.is_capability_denied_by_policy(capability) {
            return Err(PluginHostError::PolicyDenied(format!(
                "'{capability}' is denied by host policy"
            )));
        }
        let now = self.clock.now();
        let mut plugins = self.write();
        let entry = plugins
            .get_mut(plugin)
            .ok_or_else(|| PluginHostError::PluginNotFound(plugin.to_string()))?;
        if !capabilities::get_tier_limits(entry.tier).allows(capability) {
            return Err(PluginHostError::TierBlocked {
                capability: capability.to_string(),
                tier: entry.tier.to_string(),
            });
        }
        entry.grants.insert(
            capability,
            PermissionGrant {
                state: GrantState::Granted,
                updated_at: now,
            },
        );
        info!(plugin_id = %plugin, capability = %capability, "capability granted");
        Ok(())
    }

    pub fn deny_plugin_capability(&self, plugin: &PluginId, capability: Capability) -> Result<()> {
        let now = self.clock.now();
        let mut plugins = self.write();
        let entry = plugins
            .get_mut(plugin)
            .ok_or_else(|| PluginHostError::PluginNotFound(plugin.to_string()))?;
        entry.grants.insert(
            capability,
            PermissionGrant {
                state: GrantState::Denied,
                updated_at: now,
            },
        );
        info!(plugin_id = %plugin, capability = %capability, "capability denied");
        Ok(())
    }

    /// Resets a pair to `unrequested`. Returns whether a record existed.
    pub fn revoke_plugin_capability(&self, plugin: &PluginId, capability: Capability) -> bool {
        let removed = self
            .write()
            .get_mut(plugin)
            .and_then(|p| p.grants.remove(&capability))
            .is_some();
        if removed {
            info!(plugin_id = %plugin, capability = %capability, "capability revoked");
        }
        removed
    }

    /// Abandons an open consent prompt; its capabilities return to `unrequested`.
    pub fn cancel_pending_consent(&self, plugin: &PluginId) {
        let map = self.consent_cancel.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(notify) = map.get(plugin) {
            notify.notify_one();
        }
    }

    /// Forgets everything about a plugin. Used on uninstall.
    pub fn clear_plugin(&self, plugin: &PluginId) {
        self.cancel_pending_consent(plugin);
        self.write().remove(plugin);
    }

    pub fn granted_capabilities(&self, plugin: &PluginId) -> BTreeSet<Capability> {
        self.read()
            .get(plugin)
            .map(|p| {
                p.grants
                    .iter()
                    .filter(|(_, g)| g.state == GrantState::Granted)
                    .map(|(c, _)| *c)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn tier_of(&self, plugin: &PluginId) -> Option<TrustTier> {
        self.read().get(plugin).map(|p| p.tier)
    }

    /// Settled grants only; pending consent is not persisted.
    pub fn snapshot(&self) -> PermissionSnapshot {
        let plugins = self.read();
        PermissionSnapshot {
            plugins: plugins
                .iter()
                .map(|(id, p)| {
                    let grants = p
                        .grants
                        .iter()
                        .filter(|(_, g)| g.state != GrantState::PendingConsent)
                        .map(|(c, g)| (*c, *g))
                        .collect();
                    (id.clone(), PluginGrantSnapshot { tier: p.tier, grants })
                })
                .collect(),
        }
    }

    /// Replaces all state with a snapshot, dropping grants the tier forbids.
    pub fn restore(&self, snapshot: PermissionSnapshot) {
        let mut plugins = self.write();
        plugins.clear();
        for (id, p) in snapshot.plugins {
            let limits = capabilities::get_tier_limits(p.tier);
            let grants = p
                .grants
                .into_iter()
                .filter(|(c, g)| limits.allows(*c) && g.state != GrantState::PendingConsent)
                .collect();
            plugins.insert(id, PluginPermissions { tier: p.tier, grants });
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PluginId, PluginPermissions>> {
        self.plugins.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PluginId, PluginPermissions>> {
        self.plugins.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PluginId {
        PluginId::parse(s).unwrap()
    }

    fn manager(prompt: Arc<dyn ConsentPrompt>) -> PermissionManager {
        PermissionManager::new(Arc::new(PolicyEngine::unrestricted()), prompt)
    }

    #[tokio::test]
    async fn auto_grants_low_risk() {
        let pm = manager(Arc::new(AutoDeny));
        let id = pid("community.notes");
        pm.register_plugin(&id, TrustTier::Community);
        let r = pm
            .request_plugin_capabilities(&id, &[Capability::Storage], vec![])
            .await
            .unwrap();
        assert!(r.granted.contains(&Capability::Storage));
        assert!(pm.check_plugin_capability(&id, Capability::Storage).is_granted());
    }

    #[tokio::test]
    async fn unregistered_plugin_is_not_found() {
        let pm = manager(Arc::new(AutoApprove));
        let err = pm
            .request_plugin_capabilities(&pid("ghost"), &[Capability::Storage], vec![])
            .await;
        assert!(matches!(err, Err(PluginHostError::PluginNotFound(_))));
    }

    #[test]
    fn tier_downgrade_drops_grants() {
        let pm = manager(Arc::new(AutoApprove));
        let id = pid("curated.prices");
        pm.register_plugin(&id, TrustTier::Curated);
        pm.grant_plugin_capability(&id, Capability::Network).unwrap();
        pm.register_plugin(&id, TrustTier::Community);
        assert!(pm.granted_capabilities(&id).is_empty());
    }
}
