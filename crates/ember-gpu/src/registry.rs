//! Per-recording-context pool registry.

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Identity of a recording context.
///
/// Each context that records commands concurrently gets its own command and
/// staging pools. Callers pick the identifiers; a worker thread index is the
/// usual choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl ContextId {
    /// The default context.
    pub const MAIN: Self = Self(0);

    /// Context with a caller-chosen identifier.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::MAIN
    }
}

/// Lazily populated map from [`ContextId`] to an independently locked pool.
///
/// Lookups of existing contexts only take the read lock.
pub struct ContextRegistry<T> {
    entries: RwLock<HashMap<ContextId, Arc<Mutex<T>>>>,
}

impl<T> ContextRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the pool of `context`, creating it with `create` on first use.
    pub fn get_or_insert_with(
        &self,
        context: ContextId,
        create: impl FnOnce() -> T,
    ) -> Arc<Mutex<T>> {
        if let Some(entry) = self.entries.read().get(&context) {
            return entry.clone();
        }

        self.entries
            .write()
            .entry(context)
            .or_insert_with(|| Arc::new(Mutex::new(create())))
            .clone()
    }

    /// Get the pool of `context` if it exists.
    pub fn get(&self, context: ContextId) -> Option<Arc<Mutex<T>>> {
        self.entries.read().get(&context).cloned()
    }

    /// Run `f` on every registered pool.
    pub fn for_each(&self, mut f: impl FnMut(ContextId, &mut T)) {
        for (&context, entry) in self.entries.read().iter() {
            f(context, &mut entry.lock());
        }
    }

    /// Number of registered contexts.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no context registered a pool yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<T> Default for ContextRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn creates_once_per_context() {
        let registry = ContextRegistry::new();
        let mut created = 0;

        let a = registry.get_or_insert_with(ContextId::MAIN, || {
            created += 1;
            Vec::<u32>::new()
        });
        a.lock().push(7);
        let again = registry.get_or_insert_with(ContextId::MAIN, || {
            created += 1;
            Vec::new()
        });

        assert_eq!(created, 1);
        assert_eq!(*again.lock(), vec![7]);
        assert!(registry.get(ContextId::new(9)).is_none());
    }

    #[test]
    fn contexts_are_independent_across_threads() {
        let registry = Arc::new(ContextRegistry::<u64>::new());

        let handles: Vec<_> = (1..=4)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let pool = registry.get_or_insert_with(ContextId::new(i), || 0);
                    for _ in 0..100 {
                        *pool.lock() += i;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 4);
        let mut total = 0;
        registry.for_each(|_, value| total += *value);
        assert_eq!(total, 100 * (1 + 2 + 3 + 4));
    }
}
