use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use hashbrown::HashMap;
use log::warn;
use serde::Serialize;
use serde::de::DeserializeOwned;

// Cache entries are versioned so a layout change doesn't require wiping the
// shared tier; unreadable entries are just evicted.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum VersionedCacheEntry<T> {
    V0 { value: T, expires_at: DateTime<Utc> },
}

struct LocalEntry<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

/// A two-tier read-through cache. The shared tier is an optional on-disk
/// sled tree with a long TTL; the in-process tier is always present with a
/// short TTL and a bounded size. Reads try the shared tier first, then the
/// in-process tier. Shared-tier failures are counted and degrade to the
/// inner tier, never to the caller.
pub struct TieredCache<T> {
    prefix: &'static str,
    shared: Option<sled::Db>,
    shared_ttl: TimeDelta,
    local: Mutex<HashMap<i64, LocalEntry<T>>>,
    local_ttl: TimeDelta,
    local_cap: usize,
    shared_failures: AtomicU64,
}

impl<T> TieredCache<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    pub fn new(
        prefix: &'static str,
        shared: Option<sled::Db>,
        shared_ttl: TimeDelta,
        local_ttl: TimeDelta,
        local_cap: usize,
    ) -> Self {
        Self {
            prefix,
            shared,
            shared_ttl,
            local: Mutex::new(HashMap::new()),
            local_ttl,
            local_cap,
            shared_failures: AtomicU64::new(0),
        }
    }

    pub fn get(&self, id: i64, now: DateTime<Utc>) -> Option<T> {
        if let Some(value) = self.get_shared(id, now) {
            return Some(value);
        }
        self.get_local(id, now)
    }

    pub fn put(&self, id: i64, value: &T, now: DateTime<Utc>) {
        self.put_shared(id, value, now);
        self.put_local(id, value, now);
    }

    /// Number of shared-tier operations that failed and fell through. Cache
    /// failures are never surfaced to callers.
    pub fn shared_failures(&self) -> u64 {
        self.shared_failures.load(Ordering::Relaxed)
    }

    fn key(&self, id: i64) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + 1 + 8);
        key.extend_from_slice(self.prefix.as_bytes());
        key.push(b':');
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    fn get_shared(&self, id: i64, now: DateTime<Utc>) -> Option<T> {
        let shared = self.shared.as_ref()?;
        let key = self.key(id);

        let bytes = match shared.get(&key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                self.shared_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Shared cache read failed for {}: {err}", self.prefix);
                return None;
            }
        };

        let entry: VersionedCacheEntry<T> = match rmp_serde::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    "Shared cache entry for {} could not be decoded: {err}. Removing it.",
                    self.prefix
                );
                let _ = shared.remove(&key);
                return None;
            }
        };

        let VersionedCacheEntry::V0 { value, expires_at } = entry;
        if expires_at <= now {
            let _ = shared.remove(&key);
            return None;
        }
        Some(value)
    }

    fn put_shared(&self, id: i64, value: &T, now: DateTime<Utc>) {
        let Some(shared) = self.shared.as_ref() else {
            return;
        };

        let entry = VersionedCacheEntry::V0 {
            value: value.clone(),
            expires_at: now + self.shared_ttl,
        };
        let bytes = match rmp_serde::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.shared_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Shared cache encode failed for {}: {err}", self.prefix);
                return;
            }
        };

        if let Err(err) = shared.insert(self.key(id), bytes) {
            self.shared_failures.fetch_add(1, Ordering::Relaxed);
            warn!("Shared cache write failed for {}: {err}", self.prefix);
        }
    }

    fn get_local(&self, id: i64, now: DateTime<Utc>) -> Option<T> {
        let mut local = self.local.lock().expect("cache lock should not be poisoned");
        match local.get(&id) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                local.remove(&id);
                None
            }
            None => None,
        }
    }

    fn put_local(&self, id: i64, value: &T, now: DateTime<Utc>) {
        let mut local = self.local.lock().expect("cache lock should not be poisoned");

        if local.len() >= self.local_cap {
            local.retain(|_, entry| entry.expires_at > now);
        }
        if local.len() >= self.local_cap {
            // Still full after dropping expired entries; evict whatever
            // expires soonest.
            if let Some(evict) = local
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(id, _)| *id)
            {
                local.remove(&evict);
            }
        }

        local.insert(
            id,
            LocalEntry {
                value: value.clone(),
                expires_at: now + self.local_ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> TieredCache<String> {
        TieredCache::new("test", None, TimeDelta::hours(24), TimeDelta::minutes(5), 4)
    }

    #[test]
    fn local_tier_round_trips() {
        let cache = cache();
        let now = Utc::now();

        assert_eq!(cache.get(1, now), None);
        cache.put(1, &"one".to_string(), now);
        assert_eq!(cache.get(1, now), Some("one".to_string()));
    }

    #[test]
    fn local_entries_expire() {
        let cache = cache();
        let now = Utc::now();

        cache.put(1, &"one".to_string(), now);
        let later = now + TimeDelta::minutes(6);
        assert_eq!(cache.get(1, later), None);
    }

    #[test]
    fn local_tier_evicts_at_capacity() {
        let cache = cache();
        let now = Utc::now();

        for id in 0..8 {
            cache.put(id, &format!("{id}"), now + TimeDelta::seconds(id));
        }

        let local = cache.local.lock().unwrap();
        assert!(local.len() <= 4);
    }

    #[test]
    fn shared_tier_round_trips_and_expires() {
        let dir = std::env::temp_dir().join(format!("battlelog-cache-test-{}", std::process::id()));
        let db = sled::open(&dir).expect("test sled db should open");
        let cache = TieredCache::new(
            "shared",
            Some(db),
            TimeDelta::hours(24),
            TimeDelta::minutes(5),
            4,
        );
        let now = Utc::now();

        cache.put(42, &"forty-two".to_string(), now);
        assert_eq!(cache.get(42, now), Some("forty-two".to_string()));
        assert_eq!(cache.get(42, now + TimeDelta::hours(25)), None);

        drop(cache);
        let _ = std::fs::remove_dir_all(dir);
    }
}
