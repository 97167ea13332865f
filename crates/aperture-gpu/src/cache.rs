//! Content-addressed cache for lazily-created native resources.
//!
//! Maps a structural descriptor to at most one native resource instance for
//! the lifetime of the cache. Entries are boxed so that references handed out
//! stay valid across later insertions.

use crate::error::Result;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;

/// A cache mapping a descriptor key to a lazily-constructed value.
///
/// Two keys that compare equal always map to the same value instance; the
/// constructor runs at most once per distinct key. Entries live until
/// [`DescriptorCache::clear_with`] is called.
pub struct DescriptorCache<K, V> {
    entries: HashMap<K, Box<V>>,
}

impl<K, V> DescriptorCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Look up `key`, constructing the value with `create` on a miss.
    ///
    /// If `create` fails, nothing is inserted and the error is propagated;
    /// the next lookup for the same key will retry construction.
    pub fn get_or_create<F>(&mut self, key: &K, create: F) -> Result<&V>
    where
        F: FnOnce() -> Result<V>,
    {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => Ok(&**entry.into_mut()),
            Entry::Vacant(entry) => {
                let value = create()?;
                Ok(&**entry.insert(Box::new(value)))
            }
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry, running `destroy` on each value first.
    ///
    /// Must run before the device owning the cached resources is destroyed.
    pub fn clear_with<F>(&mut self, mut destroy: F)
    where
        F: FnMut(&mut V),
    {
        for (_, mut value) in self.entries.drain() {
            destroy(&mut value);
        }
    }
}

impl<K, V> Default for DescriptorCache<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpuError;

    #[test]
    fn equal_keys_share_one_instance() {
        let mut cache: DescriptorCache<u32, String> = DescriptorCache::new();
        let mut constructions = 0;

        let first = cache
            .get_or_create(&7, || {
                constructions += 1;
                Ok("value".to_string())
            })
            .unwrap() as *const String;

        let second = cache
            .get_or_create(&7, || {
                constructions += 1;
                Ok("other".to_string())
            })
            .unwrap() as *const String;

        assert_eq!(first, second);
        assert_eq!(constructions, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_keys_get_distinct_instances() {
        let mut cache: DescriptorCache<u32, String> = DescriptorCache::new();

        let first = cache
            .get_or_create(&1, || Ok("a".to_string()))
            .unwrap() as *const String;
        let second = cache
            .get_or_create(&2, || Ok("b".to_string()))
            .unwrap() as *const String;

        assert_ne!(first, second);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn references_stay_valid_across_insertions() {
        let mut cache: DescriptorCache<u32, String> = DescriptorCache::new();

        let first = cache
            .get_or_create(&0, || Ok("stable".to_string()))
            .unwrap() as *const String;

        // Force the map to grow well past its initial capacity.
        for key in 1..256 {
            cache
                .get_or_create(&key, || Ok(key.to_string()))
                .unwrap();
        }

        let relooked = cache
            .get_or_create(&0, || unreachable!("must be a hit"))
            .unwrap() as *const String;
        assert_eq!(first, relooked);
    }

    #[test]
    fn failed_construction_inserts_nothing() {
        let mut cache: DescriptorCache<u32, String> = DescriptorCache::new();

        let result = cache.get_or_create(&3, || {
            Err(GpuError::ResourceCreation {
                what: "render pass",
                code: ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            })
        });
        assert!(result.is_err());
        assert!(cache.is_empty());

        // The next lookup retries the constructor.
        cache.get_or_create(&3, || Ok("ok".to_string())).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_runs_destroy_on_every_entry() {
        let mut cache: DescriptorCache<u32, String> = DescriptorCache::new();
        for key in 0..4 {
            cache.get_or_create(&key, || Ok(key.to_string())).unwrap();
        }

        let mut destroyed = 0;
        cache.clear_with(|_| destroyed += 1);
        assert_eq!(destroyed, 4);
        assert!(cache.is_empty());

        // Clearing an empty cache is a no-op.
        cache.clear_with(|_| destroyed += 1);
        assert_eq!(destroyed, 4);
    }
}
