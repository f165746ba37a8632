use std::collections::HashSet;
use std::sync::Mutex;

/// Domain ids this process has already merged into the graph.
///
/// Only a fast path for skipping redundant MERGEs: the store's
/// merge-or-create stays the source of truth, so losing or racing an
/// entry costs one extra idempotent write and nothing else. One instance
/// is owned per coordinator and shared by its workers.
#[derive(Debug, Default)]
pub struct KnownDomains {
    ids: Mutex<HashSet<String>>,
}

impl KnownDomains {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(id)
    }

    /// Record a domain as merged. Returns false if it was already known.
    pub fn remember(&self, id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.to_string())
    }

    pub fn len(&self) -> usize {
        self.ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn remember_is_idempotent() {
        let known = KnownDomains::new();
        assert!(!known.contains("66"));
        assert!(known.remember("66"));
        assert!(!known.remember("66"));
        assert!(known.contains("66"));
        assert_eq!(known.len(), 1);
    }

    #[test]
    fn shared_across_threads() {
        let known = Arc::new(KnownDomains::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let known = known.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        known.remember(&format!("{}", (i * 100 + j) % 250));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(known.len(), 250);
    }
}
