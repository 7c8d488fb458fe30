use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/* ============================= INDEX ============================= */

/// Process-wide lookup from namespace name to the quota that owns it.
///
/// Written only by the reconciler after a successful status write; read by
/// the admission handlers as an acceleration hint. The live selector
/// evaluation in the quota webhook stays authoritative, so a stale entry
/// can delay but never corrupt an admission decision.
#[derive(Clone, Default)]
pub struct OwnershipIndex {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl OwnershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner_of(&self, namespace: &str) -> Option<String> {
        self.inner
            .read()
            .expect("ownership index lock")
            .get(namespace)
            .cloned()
    }

    /// Record one reconcile outcome: `quota` now owns exactly `selected`.
    /// Entries for namespaces the quota no longer selects are cleared.
    pub fn apply(&self, quota: &str, selected: &[String]) {
        let mut map = self.inner.write().expect("ownership index lock");
        map.retain(|ns, owner| owner.as_str() != quota || selected.iter().any(|s| s == ns));
        for ns in selected {
            map.insert(ns.clone(), quota.to_string());
        }
    }

    /// Drop every entry attributed to a deleted quota.
    pub fn release_quota(&self, quota: &str) {
        self.inner
            .write()
            .expect("ownership index lock")
            .retain(|_, owner| owner.as_str() != quota);
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.inner.read().expect("ownership index lock").clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("ownership index lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/* ============================= TESTS ============================= */
