//! Symmetric key cache
//!
//! Maps a (sender, receiver) direction to the symmetric key last used for it,
//! so consecutive messages in one direction can reuse a key instead of
//! generating and sealing a fresh one. For group messages the "receiver" is
//! the group id.
//!
//! The map is split into independently locked shards so concurrent sealing
//! workers touching different directions do not contend.
//!
//! Every stored key carries a generation number. A key stays unconfirmed
//! until [`KeyCache::confirm`] is called for its generation, which lets the
//! sealing side keep attaching it until the peer has provably received it,
//! and [`KeyCache::retire`] drop exactly the key a failed message carried
//! without touching a replacement stored since.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::keys::SymmetricKey;

const SHARDS: usize = 16;

/// How long a cached key may keep being reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyReusePolicy {
    /// Reuse until explicitly invalidated or replaced.
    #[default]
    UntilInvalidated,
    /// Reuse while younger than the given age.
    MaxAge(Duration),
    /// Never reuse; every seal generates a fresh key.
    Never,
}

struct CachedKey {
    key: Arc<dyn SymmetricKey>,
    generation: u64,
    confirmed: bool,
    created_at: Instant,
    last_used: Instant,
}

impl CachedKey {
    fn is_fresh(&self, policy: KeyReusePolicy, now: Instant) -> bool {
        match policy {
            KeyReusePolicy::UntilInvalidated => true,
            KeyReusePolicy::MaxAge(max) => now.saturating_duration_since(self.created_at) < max,
            KeyReusePolicy::Never => false,
        }
    }
}

/// A fresh cache entry as seen by a lookup.
#[derive(Clone)]
pub struct CacheHit {
    pub key: Arc<dyn SymmetricKey>,
    pub generation: u64,
    /// The receiving side is known to hold this key.
    pub confirmed: bool,
}

type Shard<I> = Mutex<HashMap<(I, I), CachedKey>>;

pub struct KeyCache<I> {
    shards: Vec<Shard<I>>,
    policy: KeyReusePolicy,
    generations: AtomicU64,
}

impl<I> KeyCache<I>
where
    I: Hash + Eq + Clone,
{
    pub fn new(policy: KeyReusePolicy) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            policy,
            generations: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> KeyReusePolicy {
        self.policy
    }

    /// Key for the direction, if one is cached and still fresh under the
    /// reuse policy. Stale entries are evicted on lookup.
    pub fn get(&self, sender: &I, receiver: &I) -> Option<Arc<dyn SymmetricKey>> {
        self.lookup(sender, receiver).map(|hit| hit.key)
    }

    /// Like [`get`](Self::get), also reporting the entry's generation and
    /// whether it has been confirmed.
    pub fn lookup(&self, sender: &I, receiver: &I) -> Option<CacheHit> {
        let slot = (sender.clone(), receiver.clone());
        let mut shard = self.shard(&slot).lock();
        let now = Instant::now();
        let fresh = shard.get(&slot).map(|cached| cached.is_fresh(self.policy, now))?;
        if !fresh {
            shard.remove(&slot);
            trace!(policy = ?self.policy, "stale key evicted");
            return None;
        }
        shard.get(&slot).map(|cached| CacheHit {
            key: Arc::clone(&cached.key),
            generation: cached.generation,
            confirmed: cached.confirmed,
        })
    }

    /// Store (or replace) the key for a direction. The new entry starts
    /// unconfirmed; its generation is returned.
    pub fn put(&self, sender: &I, receiver: &I, key: Arc<dyn SymmetricKey>) -> u64 {
        let slot = (sender.clone(), receiver.clone());
        let now = Instant::now();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        self.shard(&slot).lock().insert(
            slot,
            CachedKey {
                key,
                generation,
                confirmed: false,
                created_at: now,
                last_used: now,
            },
        );
        generation
    }

    /// Mark the key stored under `generation` as held by the receiver.
    /// Returns false when that key is no longer cached.
    pub fn confirm(&self, sender: &I, receiver: &I, generation: u64) -> bool {
        let slot = (sender.clone(), receiver.clone());
        match self.shard(&slot).lock().get_mut(&slot) {
            Some(cached) if cached.generation == generation => {
                cached.confirmed = true;
                true
            }
            _ => false,
        }
    }

    /// Drop the entry only if it is still the unconfirmed key stored under
    /// `generation`. A confirmed key is already held by the receiver.
    pub fn retire(&self, sender: &I, receiver: &I, generation: u64) -> bool {
        let slot = (sender.clone(), receiver.clone());
        let mut shard = self.shard(&slot).lock();
        let matches = shard
            .get(&slot)
            .is_some_and(|cached| cached.generation == generation && !cached.confirmed);
        if matches {
            shard.remove(&slot);
            trace!(generation, "key retired");
            return true;
        }
        false
    }

    /// Record that the cached key for a direction was just used.
    pub fn touch(&self, sender: &I, receiver: &I) {
        let slot = (sender.clone(), receiver.clone());
        if let Some(cached) = self.shard(&slot).lock().get_mut(&slot) {
            cached.last_used = Instant::now();
        }
    }

    /// Time since the key for a direction was last used.
    pub fn idle_for(&self, sender: &I, receiver: &I) -> Option<Duration> {
        let slot = (sender.clone(), receiver.clone());
        let shard = self.shard(&slot).lock();
        shard.get(&slot).map(|cached| cached.last_used.elapsed())
    }

    pub fn invalidate(&self, sender: &I, receiver: &I) {
        let slot = (sender.clone(), receiver.clone());
        self.shard(&slot).lock().remove(&slot);
    }

    pub fn clear(&self) {
        let mut dropped = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            dropped += shard.len();
            shard.clear();
        }
        debug!(dropped, "key cache cleared");
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, slot: &(I, I)) -> &Shard<I> {
        let mut hasher = DefaultHasher::new();
        slot.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }
}

impl<I> Default for KeyCache<I>
where
    I: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new(KeyReusePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead::ContentKey;

    fn key() -> Arc<dyn SymmetricKey> {
        Arc::new(ContentKey::generate())
    }

    fn same_key(a: &Arc<dyn SymmetricKey>, b: &Arc<dyn SymmetricKey>) -> bool {
        a.to_bytes().as_slice() == b.to_bytes().as_slice()
    }

    #[test]
    fn put_then_get_returns_same_key() {
        let cache = KeyCache::<String>::default();
        let k = key();
        cache.put(&"alice".into(), &"bob".into(), Arc::clone(&k));
        let got = cache.get(&"alice".into(), &"bob".into()).unwrap();
        assert!(same_key(&k, &got));
    }

    #[test]
    fn directions_are_independent() {
        let cache = KeyCache::<String>::default();
        cache.put(&"alice".into(), &"bob".into(), key());
        assert!(cache.get(&"bob".into(), &"alice".into()).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = KeyCache::<String>::default();
        cache.put(&"alice".into(), &"bob".into(), key());
        cache.invalidate(&"alice".into(), &"bob".into());
        assert!(cache.get(&"alice".into(), &"bob".into()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn max_age_expires_entries() {
        let cache = KeyCache::<String>::new(KeyReusePolicy::MaxAge(Duration::from_millis(0)));
        cache.put(&"alice".into(), &"bob".into(), key());
        assert!(cache.get(&"alice".into(), &"bob".into()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn never_policy_does_not_reuse() {
        let cache = KeyCache::<String>::new(KeyReusePolicy::Never);
        cache.put(&"alice".into(), &"bob".into(), key());
        assert!(cache.get(&"alice".into(), &"bob".into()).is_none());
    }

    #[test]
    fn put_replaces_existing_key() {
        let cache = KeyCache::<String>::default();
        let first = key();
        let second = key();
        cache.put(&"alice".into(), &"bob".into(), first);
        cache.put(&"alice".into(), &"bob".into(), Arc::clone(&second));
        let got = cache.get(&"alice".into(), &"bob".into()).unwrap();
        assert!(same_key(&second, &got));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn touch_resets_idle_time() {
        let cache = KeyCache::<String>::default();
        cache.put(&"alice".into(), &"bob".into(), key());
        std::thread::sleep(Duration::from_millis(20));
        let before = cache.idle_for(&"alice".into(), &"bob".into()).unwrap();
        cache.touch(&"alice".into(), &"bob".into());
        let after = cache.idle_for(&"alice".into(), &"bob".into()).unwrap();
        assert!(after < before);
    }

    #[test]
    fn new_keys_start_unconfirmed() {
        let cache = KeyCache::<String>::default();
        let generation = cache.put(&"alice".into(), &"bob".into(), key());
        let hit = cache.lookup(&"alice".into(), &"bob".into()).unwrap();
        assert_eq!(hit.generation, generation);
        assert!(!hit.confirmed);

        assert!(cache.confirm(&"alice".into(), &"bob".into(), generation));
        assert!(cache.lookup(&"alice".into(), &"bob".into()).unwrap().confirmed);
    }

    #[test]
    fn confirm_ignores_replaced_generation() {
        let cache = KeyCache::<String>::default();
        let old = cache.put(&"alice".into(), &"bob".into(), key());
        let new = cache.put(&"alice".into(), &"bob".into(), key());
        assert_ne!(old, new);
        assert!(!cache.confirm(&"alice".into(), &"bob".into(), old));
        assert!(!cache.lookup(&"alice".into(), &"bob".into()).unwrap().confirmed);
    }

    #[test]
    fn retire_only_drops_matching_generation() {
        let cache = KeyCache::<String>::default();
        let old = cache.put(&"alice".into(), &"bob".into(), key());
        let new = cache.put(&"alice".into(), &"bob".into(), key());
        assert!(!cache.retire(&"alice".into(), &"bob".into(), old));
        assert_eq!(cache.len(), 1);
        assert!(cache.retire(&"alice".into(), &"bob".into(), new));
        assert!(cache.is_empty());
    }

    #[test]
    fn retire_keeps_confirmed_key() {
        let cache = KeyCache::<String>::default();
        let generation = cache.put(&"alice".into(), &"bob".into(), key());
        cache.confirm(&"alice".into(), &"bob".into(), generation);
        assert!(!cache.retire(&"alice".into(), &"bob".into(), generation));
        assert!(cache.get(&"alice".into(), &"bob".into()).is_some());
    }

    #[test]
    fn concurrent_access_across_shards() {
        let cache = Arc::new(KeyCache::<String>::default());
        std::thread::scope(|scope| {
            for t in 0..8 {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for i in 0..50 {
                        let sender = format!("user-{t}");
                        let receiver = format!("peer-{i}");
                        cache.put(&sender, &receiver, key());
                        assert!(cache.get(&sender, &receiver).is_some());
                    }
                });
            }
        });
        assert_eq!(cache.len(), 8 * 50);
    }
}
