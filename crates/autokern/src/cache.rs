use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

type Slot<V> = Arc<Mutex<Option<Arc<V>>>>;

/// Map whose values are built at most once per key.
///
/// Each key owns a gate; the first caller builds under the gate while later
/// callers for the same key wait and then reuse the stored value. Builds for
/// different keys run concurrently. A failed build leaves the slot empty, so
/// the next caller retries.
pub(crate) struct BuildOnceCache<K, V> {
    entries: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> BuildOnceCache<K, V>
where
    K: Eq + Hash,
{
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value and `true`, or builds it and returns `false`.
    pub(crate) fn get_or_try_build<E, F>(&self, key: K, build: F) -> Result<(Arc<V>, bool), E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let gate = {
            let mut entries = self.entries.lock().expect("build-once cache poisoned");
            entries
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };

        let mut slot = gate.lock().expect("build-once cache gate poisoned");
        if let Some(existing) = slot.as_ref() {
            return Ok((Arc::clone(existing), true));
        }
        let built = Arc::new(build()?);
        *slot = Some(Arc::clone(&built));
        Ok((built, false))
    }

    pub(crate) fn get(&self, key: &K) -> Option<Arc<V>> {
        let gate = self
            .entries
            .lock()
            .expect("build-once cache poisoned")
            .get(key)
            .cloned()?;
        let slot = gate.lock().expect("build-once cache gate poisoned");
        slot.as_ref().cloned()
    }

    /// Number of keys with a stored value.
    pub(crate) fn len(&self) -> usize {
        let gates: Vec<Slot<V>> = self
            .entries
            .lock()
            .expect("build-once cache poisoned")
            .values()
            .cloned()
            .collect();
        gates
            .iter()
            .filter(|gate| gate.lock().expect("build-once cache gate poisoned").is_some())
            .count()
    }
}

impl<K, V> Default for BuildOnceCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn second_lookup_reuses_the_first_build() {
        let cache: BuildOnceCache<&str, u32> = BuildOnceCache::new();
        let (first, hit) = cache.get_or_try_build("k", || Ok::<_, ()>(7)).unwrap();
        assert!(!hit);
        let (second, hit) = cache
            .get_or_try_build("k", || -> Result<u32, ()> { panic!("rebuilt") })
            .unwrap();
        assert!(hit);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_build_is_retried() {
        let cache: BuildOnceCache<u8, u8> = BuildOnceCache::new();
        assert_eq!(cache.get_or_try_build(1, || Err("boom")).unwrap_err(), "boom");
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.len(), 0);
        let (value, hit) = cache.get_or_try_build(1, || Ok::<_, &str>(3)).unwrap();
        assert_eq!((*value, hit), (3, false));
    }

    #[test]
    fn concurrent_callers_observe_a_single_build() {
        let cache: Arc<BuildOnceCache<u8, usize>> = Arc::new(BuildOnceCache::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let builds = Arc::clone(&builds);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let (value, _) = cache
                        .get_or_try_build(0, || {
                            thread::sleep(std::time::Duration::from_millis(5));
                            Ok::<_, ()>(builds.fetch_add(1, Ordering::SeqCst))
                        })
                        .unwrap();
                    *value
                })
            })
            .collect();
        let values: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| *v == 0));
    }
}
