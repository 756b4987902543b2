//! The merged capability namespace.
//!
//! The registry owns two mappings: qualified name -> descriptor, and
//! server id -> the set of qualified names it contributed (used to bulk
//! prune when a server leaves `Running`). Qualified names are unique per
//! capability kind at all times; collisions are settled at registration,
//! never at call time.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ConflictResolution;
use crate::core::capability::{CapabilityDescriptor, CapabilityKind, DiscoveredCapabilities};
use crate::utils::errors::{ComposeError, ComposeResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CapabilityKey {
    kind: CapabilityKind,
    name: String,
}

/// A conflict settled during registration, kept for the composition summary.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictRecord {
    pub kind: CapabilityKind,
    pub name: String,
    pub kept_server: String,
    pub dropped_server: String,
    pub resolution: &'static str,
}

/// Outcome of registering one server's discovery results.
#[derive(Debug, Clone, Default)]
pub struct RegistrationReport {
    pub registered: usize,
    pub dropped: usize,
    pub overridden: usize,
}

#[derive(Default)]
struct RegistryInner {
    by_name: HashMap<CapabilityKey, CapabilityDescriptor>,
    by_server: HashMap<String, HashSet<CapabilityKey>>,
    conflicts: Vec<ConflictRecord>,
}

pub struct CapabilityRegistry {
    policy: ConflictResolution,
    inner: RwLock<RegistryInner>,
}

impl CapabilityRegistry {
    pub fn new(policy: ConflictResolution) -> Self {
        Self {
            policy,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn policy(&self) -> ConflictResolution {
        self.policy
    }

    fn qualified_name(&self, server_id: &str, original: &str) -> String {
        match self.policy {
            ConflictResolution::Prefix => format!("{}:{}", server_id, original),
            ConflictResolution::Suffix => format!("{}:{}", original, server_id),
            _ => original.to_string(),
        }
    }

    /// Register everything one server advertised, atomically.
    ///
    /// Under the `error` policy a collision with another server commits
    /// nothing from the incoming server and fails its startup; every other
    /// policy always succeeds.
    pub fn register_server(
        &self,
        server_id: &str,
        discovered: &DiscoveredCapabilities,
    ) -> ComposeResult<RegistrationReport> {
        let mut inner = self.inner.write();
        let mut report = RegistrationReport::default();

        // Stage first so the `error` policy can reject without side effects.
        let mut staged: Vec<CapabilityDescriptor> = Vec::with_capacity(discovered.len());
        let mut staged_keys: HashSet<CapabilityKey> = HashSet::new();
        let mut records: Vec<ConflictRecord> = Vec::new();

        for kind in CapabilityKind::ALL {
            for (original, schema) in discovered.entries(kind) {
                let qualified = self.qualified_name(server_id, original);
                let key = CapabilityKey {
                    kind,
                    name: qualified.clone(),
                };

                // Duplicate within this server's own advertisement.
                if staged_keys.contains(&key) {
                    warn!(
                        server = server_id,
                        name = %qualified,
                        "server advertised duplicate {} name, keeping first",
                        kind
                    );
                    report.dropped += 1;
                    continue;
                }

                if let Some(existing) = inner.by_name.get(&key) {
                    match self.policy {
                        ConflictResolution::Error => {
                            return Err(ComposeError::RegistrationConflict {
                                name: qualified,
                                existing_server: existing.owning_server_id.clone(),
                                incoming_server: server_id.to_string(),
                            });
                        }
                        ConflictResolution::Ignore => {
                            warn!(
                                server = server_id,
                                name = %qualified,
                                kept = %existing.owning_server_id,
                                "ignoring conflicting {} registration",
                                kind
                            );
                            records.push(ConflictRecord {
                                kind,
                                name: qualified,
                                kept_server: existing.owning_server_id.clone(),
                                dropped_server: server_id.to_string(),
                                resolution: "ignore",
                            });
                            report.dropped += 1;
                            continue;
                        }
                        ConflictResolution::Override => {
                            records.push(ConflictRecord {
                                kind,
                                name: qualified.clone(),
                                kept_server: server_id.to_string(),
                                dropped_server: existing.owning_server_id.clone(),
                                resolution: "override",
                            });
                            report.overridden += 1;
                            // Fall through: the staged entry replaces it.
                        }
                        // Prefix/suffix qualification cannot collide across
                        // servers; a hit here means a leftover from a prune
                        // that never ran. Replace it.
                        ConflictResolution::Prefix | ConflictResolution::Suffix => {
                            debug!(name = %qualified, "replacing stale registry entry");
                        }
                    }
                }

                staged_keys.insert(key);
                staged.push(CapabilityDescriptor {
                    original_name: original.clone(),
                    owning_server_id: server_id.to_string(),
                    qualified_name: qualified,
                    kind,
                    schema: schema.clone(),
                });
            }
        }

        // Commit.
        for descriptor in staged {
            let key = CapabilityKey {
                kind: descriptor.kind,
                name: descriptor.qualified_name.clone(),
            };
            if let Some(previous) = inner.by_name.insert(key.clone(), descriptor) {
                // An override: detach the key from the previous owner so a
                // later prune of that server cannot remove the new entry.
                if previous.owning_server_id != server_id {
                    if let Some(keys) = inner.by_server.get_mut(&previous.owning_server_id) {
                        keys.remove(&key);
                    }
                }
            }
            inner
                .by_server
                .entry(server_id.to_string())
                .or_default()
                .insert(key);
            report.registered += 1;
        }
        inner.conflicts.extend(records);

        debug!(
            server = server_id,
            registered = report.registered,
            dropped = report.dropped,
            "registry updated"
        );
        Ok(report)
    }

    /// Drop every capability a server contributed. Called on any transition
    /// out of `Running`.
    pub fn remove_server(&self, server_id: &str) -> usize {
        let mut inner = self.inner.write();
        let keys = inner.by_server.remove(server_id).unwrap_or_default();
        let removed = keys.len();
        for key in keys {
            inner.by_name.remove(&key);
        }
        if removed > 0 {
            debug!(server = server_id, removed, "pruned registry contributions");
        }
        removed
    }

    pub fn resolve(&self, kind: CapabilityKind, qualified_name: &str) -> Option<CapabilityDescriptor> {
        let key = CapabilityKey {
            kind,
            name: qualified_name.to_string(),
        };
        self.inner.read().by_name.get(&key).cloned()
    }

    /// List descriptors, optionally restricted to a kind and a substring
    /// filter on the qualified name. Sorted for stable output.
    pub fn list(
        &self,
        kind: Option<CapabilityKind>,
        filter: Option<&str>,
    ) -> Vec<CapabilityDescriptor> {
        let inner = self.inner.read();
        let mut out: Vec<CapabilityDescriptor> = inner
            .by_name
            .values()
            .filter(|d| kind.map_or(true, |k| d.kind == k))
            .filter(|d| filter.map_or(true, |f| d.qualified_name.contains(f)))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        out
    }

    /// Qualified names a server currently contributes.
    pub fn contributions(&self, server_id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .by_server
            .get(server_id)
            .map(|keys| keys.iter().map(|k| k.name.clone()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn conflicts_resolved(&self) -> Vec<ConflictRecord> {
        self.inner.read().conflicts.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn discovered(tools: &[&str]) -> DiscoveredCapabilities {
        let mut d = DiscoveredCapabilities::default();
        for name in tools {
            d.tools
                .push((name.to_string(), json!({"name": name, "inputSchema": {}})));
        }
        d
    }

    #[test]
    fn test_prefix_qualifies_unconditionally() {
        let registry = CapabilityRegistry::new(ConflictResolution::Prefix);
        registry
            .register_server("calc", &discovered(&["add"]))
            .unwrap();

        assert!(registry.resolve(CapabilityKind::Tool, "calc:add").is_some());
        assert!(registry.resolve(CapabilityKind::Tool, "add").is_none());
    }

    #[test]
    fn test_suffix_qualifies_unconditionally() {
        let registry = CapabilityRegistry::new(ConflictResolution::Suffix);
        registry
            .register_server("calc", &discovered(&["add"]))
            .unwrap();

        assert!(registry.resolve(CapabilityKind::Tool, "add:calc").is_some());
    }

    #[test]
    fn test_ignore_keeps_first() {
        let registry = CapabilityRegistry::new(ConflictResolution::Ignore);
        registry
            .register_server("alpha", &discovered(&["ping"]))
            .unwrap();
        let report = registry
            .register_server("beta", &discovered(&["ping"]))
            .unwrap();

        assert_eq!(report.dropped, 1);
        let descriptor = registry.resolve(CapabilityKind::Tool, "ping").unwrap();
        assert_eq!(descriptor.owning_server_id, "alpha");
        assert!(registry.contributions("beta").is_empty());
    }

    #[test]
    fn test_override_last_wins_and_prune_is_safe() {
        let registry = CapabilityRegistry::new(ConflictResolution::Override);
        registry
            .register_server("alpha", &discovered(&["ping"]))
            .unwrap();
        registry
            .register_server("beta", &discovered(&["ping"]))
            .unwrap();

        let descriptor = registry.resolve(CapabilityKind::Tool, "ping").unwrap();
        assert_eq!(descriptor.owning_server_id, "beta");

        // Pruning the overridden server must not take out beta's entry.
        registry.remove_server("alpha");
        assert!(registry.resolve(CapabilityKind::Tool, "ping").is_some());
    }

    #[test]
    fn test_error_policy_commits_nothing_from_loser() {
        let registry = CapabilityRegistry::new(ConflictResolution::Error);
        registry
            .register_server("alpha", &discovered(&["ping"]))
            .unwrap();

        let mut incoming = discovered(&["unique"]);
        incoming
            .tools
            .push(("ping".to_string(), json!({"name": "ping"})));
        let err = registry.register_server("beta", &incoming).unwrap_err();
        assert!(matches!(err, ComposeError::RegistrationConflict { .. }));

        // Neither the colliding nor the unique tool from beta landed.
        assert!(registry.resolve(CapabilityKind::Tool, "unique").is_none());
        assert_eq!(
            registry
                .resolve(CapabilityKind::Tool, "ping")
                .unwrap()
                .owning_server_id,
            "alpha"
        );
    }

    #[test]
    fn test_same_name_different_kinds_do_not_collide() {
        let registry = CapabilityRegistry::new(ConflictResolution::Error);
        let mut d = DiscoveredCapabilities::default();
        d.tools.push(("status".into(), json!({"name": "status"})));
        d.prompts.push(("status".into(), json!({"name": "status"})));

        registry.register_server("mono", &d).unwrap();
        assert!(registry.resolve(CapabilityKind::Tool, "status").is_some());
        assert!(registry.resolve(CapabilityKind::Prompt, "status").is_some());
    }

    #[test]
    fn test_remove_server_prunes_all_contributions() {
        let registry = CapabilityRegistry::new(ConflictResolution::Prefix);
        registry
            .register_server("calc", &discovered(&["add", "sub"]))
            .unwrap();

        assert_eq!(registry.remove_server("calc"), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.remove_server("calc"), 0);
    }

    #[test]
    fn test_list_filters_by_kind_and_substring() {
        let registry = CapabilityRegistry::new(ConflictResolution::Prefix);
        registry
            .register_server("calc", &discovered(&["add", "sub"]))
            .unwrap();
        registry
            .register_server("echo", &discovered(&["reverse"]))
            .unwrap();

        let all = registry.list(Some(CapabilityKind::Tool), None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].qualified_name, "calc:add");

        let filtered = registry.list(None, Some("echo:"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].qualified_name, "echo:reverse");
    }

    #[test]
    fn test_duplicate_within_one_server_keeps_first() {
        let registry = CapabilityRegistry::new(ConflictResolution::Prefix);
        let mut d = discovered(&["add"]);
        d.tools
            .push(("add".to_string(), json!({"name": "add", "v": 2})));

        let report = registry.register_server("calc", &d).unwrap();
        assert_eq!(report.registered, 1);
        assert_eq!(report.dropped, 1);
    }
}
