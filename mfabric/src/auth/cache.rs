use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytestring::ByteString;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::types::{Decision, PolicyTuple};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tuple: PolicyTuple,
    /// Credential digest, a new credential for the same subject misses.
    pub fingerprint: ByteString,
}

#[derive(Clone, Copy)]
struct Entry {
    decision: Decision,
    expires: Instant,
}

/// Sharded LRU of oracle decisions. Permits live for `ttl`, denials are only
/// kept when `negative_ttl` is set.
pub struct DecisionCache {
    shards: Vec<Mutex<LruCache<CacheKey, Entry>>>,
    hasher: ahash::RandomState,
    ttl: Duration,
    negative_ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DecisionCache {
    pub fn new(capacity: usize, shards: usize, ttl: Duration, negative_ttl: Option<Duration>) -> Self {
        let shards = shards.max(1);
        let per_shard = NonZeroUsize::new(capacity.div_ceil(shards).max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            shards: (0..shards).map(|_| Mutex::new(LruCache::new(per_shard))).collect(),
            hasher: ahash::RandomState::new(),
            ttl,
            negative_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, key: &CacheKey) -> &Mutex<LruCache<CacheKey, Entry>> {
        let idx = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    pub fn get(&self, key: &CacheKey) -> Option<Decision> {
        let mut shard = self.shard(key).lock();
        let found = match shard.get(key) {
            Some(e) if e.expires > Instant::now() => Some(e.decision),
            Some(_) => {
                shard.pop(key);
                None
            }
            None => None,
        };
        drop(shard);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Returns false when the decision is not cacheable.
    pub fn put(&self, key: CacheKey, decision: Decision) -> bool {
        let ttl = match decision {
            Decision::Permitted => self.ttl,
            Decision::Denied | Decision::NotFound => match self.negative_ttl {
                Some(ttl) => ttl,
                None => return false,
            },
        };
        if ttl.is_zero() {
            return false;
        }
        let expires = Instant::now() + ttl;
        self.shard(&key).lock().put(key, Entry { decision, expires });
        true
    }

    /// Drops every decision about the tuple's object for the tuple's subject,
    /// whatever credential it was made for. Returns the number removed.
    pub fn invalidate(&self, tuple: &PolicyTuple) -> usize {
        self.invalidate_by(|k| {
            k.tuple.subject_id == tuple.subject_id
                && k.tuple.object_type == tuple.object_type
                && k.tuple.object_id == tuple.object_id
        })
    }

    pub fn invalidate_by<F>(&self, f: F) -> usize
    where
        F: Fn(&CacheKey) -> bool,
    {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let stale = shard.iter().filter(|(k, _)| f(k)).map(|(k, _)| k.clone()).collect::<Vec<_>>();
            for k in stale {
                shard.pop(&k);
                removed += 1;
            }
        }
        removed
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "len": self.len(),
            "hits": self.hits.load(Ordering::Relaxed),
            "misses": self.misses.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, ObjectType, SubjectType};

    fn key(subject: &str, object: &str, fp: &str) -> CacheKey {
        CacheKey {
            tuple: PolicyTuple {
                subject_type: SubjectType::User,
                subject_id: subject.into(),
                relation: Action::Publish,
                object_type: ObjectType::Channel,
                object_id: object.into(),
            },
            fingerprint: fp.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn positive_ttl() {
        let c = DecisionCache::new(100, 4, Duration::from_secs(5), None);
        assert!(c.put(key("u1", "ch1", "f"), Decision::Permitted));
        assert_eq!(c.get(&key("u1", "ch1", "f")), Some(Decision::Permitted));
        assert_eq!(c.get(&key("u1", "ch1", "other")), None);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(c.get(&key("u1", "ch1", "f")), None);
        assert!(c.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn negative_decisions() {
        let c = DecisionCache::new(100, 4, Duration::from_secs(5), None);
        assert!(!c.put(key("u1", "ch1", "f"), Decision::Denied));
        assert_eq!(c.get(&key("u1", "ch1", "f")), None);

        let c = DecisionCache::new(100, 4, Duration::from_secs(5), Some(Duration::from_secs(1)));
        assert!(c.put(key("u1", "ch1", "f"), Decision::NotFound));
        assert_eq!(c.get(&key("u1", "ch1", "f")), Some(Decision::NotFound));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(c.get(&key("u1", "ch1", "f")), None);
    }

    #[test]
    fn invalidate_across_shards() {
        let c = DecisionCache::new(100, 8, Duration::from_secs(5), None);
        for fp in ["a", "b", "c"] {
            c.put(key("u1", "ch3", fp), Decision::Permitted);
        }
        c.put(key("u2", "ch3", "a"), Decision::Permitted);
        c.put(key("u1", "ch4", "a"), Decision::Permitted);
        assert_eq!(c.invalidate(&key("u1", "ch3", "").tuple), 3);
        assert_eq!(c.len(), 2);
        c.clear();
        assert!(c.is_empty());
    }

    #[test]
    fn capacity_is_bounded() {
        let c = DecisionCache::new(4, 1, Duration::from_secs(5), None);
        for i in 0..10 {
            c.put(key("u1", &format!("ch{i}"), "f"), Decision::Permitted);
        }
        assert_eq!(c.len(), 4);
        assert_eq!(c.get(&key("u1", "ch9", "f")), Some(Decision::Permitted));
        assert_eq!(c.get(&key("u1", "ch0", "f")), None);
    }
}
