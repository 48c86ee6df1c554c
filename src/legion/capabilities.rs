//! Central capability registry for minion discovery.
//!
//! Keyword → set of session ids. Registration happens at spawn time,
//! deregistration on disposal; lookups power the discovery tools
//! minions use to find collaborators.

use dashmap::DashMap;

/// Concurrent keyword index over minions.
#[derive(Default)]
pub struct CapabilityRegistry {
    // capability keyword -> session ids advertising it
    index: DashMap<String, Vec<String>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every capability keyword for a minion.
    pub fn register(&self, session_id: &str, capabilities: &[String]) {
        for capability in capabilities {
            let mut entry = self.index.entry(capability.clone()).or_default();
            if !entry.contains(&session_id.to_string()) {
                entry.push(session_id.to_string());
            }
        }
    }

    /// Remove a minion from every keyword it is registered under.
    pub fn unregister(&self, session_id: &str) {
        let mut empty_keys = Vec::new();
        for mut entry in self.index.iter_mut() {
            entry.value_mut().retain(|sid| sid != session_id);
            if entry.value().is_empty() {
                empty_keys.push(entry.key().clone());
            }
        }
        for key in empty_keys {
            self.index.remove_if(&key, |_, sids| sids.is_empty());
        }
    }

    /// Session ids advertising a capability keyword.
    pub fn find(&self, capability: &str) -> Vec<String> {
        self.index
            .get(capability)
            .map(|sids| sids.clone())
            .unwrap_or_default()
    }

    /// True when any keyword references the minion.
    pub fn contains_session(&self, session_id: &str) -> bool {
        self.index
            .iter()
            .any(|entry| entry.value().contains(&session_id.to_string()))
    }

    /// All registered keywords.
    pub fn keywords(&self) -> Vec<String> {
        self.index.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_find() {
        let registry = CapabilityRegistry::new();
        registry.register("m1", &["rust".to_string(), "databases".to_string()]);
        registry.register("m2", &["rust".to_string()]);

        let mut rust = registry.find("rust");
        rust.sort();
        assert_eq!(rust, vec!["m1", "m2"]);
        assert_eq!(registry.find("databases"), vec!["m1"]);
        assert!(registry.find("frontend").is_empty());
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = CapabilityRegistry::new();
        registry.register("m1", &["rust".to_string()]);
        registry.register("m1", &["rust".to_string()]);
        assert_eq!(registry.find("rust").len(), 1);
    }

    #[test]
    fn test_unregister_removes_everywhere() {
        let registry = CapabilityRegistry::new();
        registry.register("m1", &["rust".to_string(), "databases".to_string()]);
        registry.register("m2", &["rust".to_string()]);

        registry.unregister("m1");
        assert!(!registry.contains_session("m1"));
        assert_eq!(registry.find("rust"), vec!["m2"]);
        assert!(registry.find("databases").is_empty());
    }
}
