use dashmap::DashMap;
use std::ops::DerefMut;
use std::sync::{Arc, RwLock, RwLockWriteGuard, Weak};

/// Hands out shared instances by name, generating them on demand. Only weak references are
/// cached, so an instance lives exactly as long as somebody outside of the resolver holds it.
pub struct Resolver<T> {
    ref_cache: DashMap<String, RwLock<Weak<T>>>,
}

impl<T> Default for Resolver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Resolver<T> {
    pub fn new() -> Self {
        Self {
            ref_cache: DashMap::with_capacity(100),
        }
    }

    pub fn resolve<F>(&self, name: &str, generate: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        // Easy path: The cache contains a weak reference
        if let Some(weak_lock) = self.ref_cache.get(name) {
            {
                let weak = weak_lock.read().expect("Get the read lock on the entry");
                if let Some(arc) = weak.upgrade() {
                    return arc;
                }
            }

            let mut weak = weak_lock.write().expect("Get the write lock on the entry");
            return Self::generate(&mut weak, generate);
        }

        // Heavier path: insert the entry first and generate while only holding the entry's lock,
        // not the shard.
        let entry = self
            .ref_cache
            .entry(name.to_string())
            .or_insert_with(|| RwLock::new(Weak::new()))
            .downgrade();
        let mut weak = entry.write().expect("Get the write lock on the entry");
        Self::generate(&mut weak, generate)
    }

    fn generate<F>(weak: &mut RwLockWriteGuard<Weak<T>>, generate: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        match weak.upgrade() {
            Some(arc) => arc, // maybe we have been raced
            None => {
                let arc = Arc::new(generate());
                *weak.deref_mut() = Arc::downgrade(&arc);
                arc
            }
        }
    }

    /// Number of entries that still resolve to a live instance.
    pub fn live(&self) -> usize {
        self.ref_cache
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .read()
                    .expect("Get the read lock on the entry")
                    .strong_count()
                    > 0
            })
            .count()
    }

    /// Drops entries whose instances are gone.
    pub fn prune(&self) {
        self.ref_cache.retain(|_, weak| {
            weak.get_mut()
                .map(|weak| weak.strong_count() > 0)
                .unwrap_or(false)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_live_instances() {
        let resolver = Resolver::<String>::new();
        let a = resolver.resolve("a", || "first".to_string());
        let b = resolver.resolve("a", || "second".to_string());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, "first");
    }

    #[test]
    fn regenerates_dropped_instances() {
        let resolver = Resolver::<String>::new();
        drop(resolver.resolve("a", || "first".to_string()));
        assert_eq!(resolver.live(), 0);

        let again = resolver.resolve("a", || "second".to_string());
        assert_eq!(*again, "second");
        assert_eq!(resolver.live(), 1);

        drop(again);
        resolver.prune();
        assert_eq!(resolver.live(), 0);
    }
}
