use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
struct KindEntry {
    ordered: Vec<String>,
    members: HashSet<String>,
}

/// Run-lifetime registry of identifiers observed in successful responses, keyed by
/// resource kind.
///
/// The store only grows. Identifiers stay registered even after the remote object is
/// deleted, so later inputs keep probing stale references. Each append happens under
/// the write lock, so readers see either the old or the new set of a kind, never a
/// partial one.
#[derive(Debug, Default)]
pub struct ResourceStore {
    kinds: RwLock<HashMap<String, KindEntry>>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` under `kind`. Returns `false` when it was already known.
    pub fn register(&self, kind: &str, id: impl Into<String>) -> bool {
        let id = id.into();
        let mut kinds = self.kinds.write().unwrap_or_else(PoisonError::into_inner);
        let entry = kinds.entry(kind.to_string()).or_default();
        if entry.members.insert(id.clone()) {
            entry.ordered.push(id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, kind: &str, id: &str) -> bool {
        let kinds = self.kinds.read().unwrap_or_else(PoisonError::into_inner);
        kinds
            .get(kind)
            .is_some_and(|entry| entry.members.contains(id))
    }

    /// Identifiers of `kind` in registration order.
    pub fn identifiers(&self, kind: &str) -> Vec<String> {
        let kinds = self.kinds.read().unwrap_or_else(PoisonError::into_inner);
        kinds
            .get(kind)
            .map(|entry| entry.ordered.clone())
            .unwrap_or_default()
    }

    /// Picks a uniformly random registered identifier of `kind`.
    pub fn pick<R: Rng + ?Sized>(&self, kind: &str, rng: &mut R) -> Option<String> {
        let kinds = self.kinds.read().unwrap_or_else(PoisonError::into_inner);
        let entry = kinds.get(kind)?;
        if entry.ordered.is_empty() {
            return None;
        }
        let index = rng.random_range(0..entry.ordered.len());
        Some(entry.ordered[index].clone())
    }

    pub fn count(&self, kind: &str) -> usize {
        let kinds = self.kinds.read().unwrap_or_else(PoisonError::into_inner);
        kinds.get(kind).map_or(0, |entry| entry.ordered.len())
    }

    pub fn total(&self) -> usize {
        let kinds = self.kinds.read().unwrap_or_else(PoisonError::into_inner);
        kinds.values().map(|entry| entry.ordered.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Per-kind identifier counts, sorted by kind.
    pub fn snapshot(&self) -> BTreeMap<String, usize> {
        let kinds = self.kinds.read().unwrap_or_else(PoisonError::into_inner);
        kinds
            .iter()
            .map(|(kind, entry)| (kind.clone(), entry.ordered.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::sync::Arc;

    #[test]
    fn register_keeps_order_and_rejects_duplicates() {
        let store = ResourceStore::new();
        assert!(store.is_empty());
        assert!(store.register("widget", "w-1"));
        assert!(store.register("widget", "w-2"));
        assert!(!store.register("widget", "w-1"));
        assert!(store.register("gadget", "g-1"));

        assert_eq!(store.identifiers("widget"), vec!["w-1", "w-2"]);
        assert_eq!(store.count("widget"), 2);
        assert_eq!(store.total(), 3);
        assert!(store.contains("gadget", "g-1"));
        assert!(!store.contains("gadget", "w-1"));
        assert!(store.identifiers("unknown").is_empty());

        let snapshot = store.snapshot();
        assert_eq!(snapshot.get("widget"), Some(&2));
        assert_eq!(snapshot.get("gadget"), Some(&1));
    }

    #[test]
    fn pick_only_returns_registered_identifiers() {
        let store = ResourceStore::new();
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        assert!(store.pick("widget", &mut rng).is_none());

        store.register("widget", "a");
        store.register("widget", "b");
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = store.pick("widget", &mut rng).expect("kind is populated");
            assert!(store.contains("widget", &id));
            seen.insert(id);
        }
        assert_eq!(seen.len(), 2, "both identifiers should be drawn over 100 picks");
    }

    #[test]
    fn concurrent_readers_observe_whole_appends() {
        let store = Arc::new(ResourceStore::new());
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..500 {
                    store.register("widget", format!("w-{i}"));
                }
            })
        };
        for _ in 0..200 {
            let ids = store.identifiers("widget");
            for (position, id) in ids.iter().enumerate() {
                assert_eq!(id, &format!("w-{position}"));
            }
        }
        writer.join().expect("writer thread panicked");
        assert_eq!(store.count("widget"), 500);
    }
}
