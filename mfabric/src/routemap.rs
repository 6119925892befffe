//! Bridge-local maps between external protocol ids and fabric ids.
//!
//! Every mapping is saved in both directions, `prefix:id:<id>` and
//! `prefix:ext:<ext>`, so a bridge can resolve either side. The two
//! directions never share a key, so an id may equal some external id.
//! Entries are derived from the event log and cached for a short TTL.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use mfabric_conf::RouteMap as RouteMapConfig;

use crate::types::DashMap;
use crate::{FabricError, Result};

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns the removed value.
    async fn remove(&self, key: &str) -> Result<Option<String>>;

    async fn len(&self) -> Result<usize>;
}

/// Consulted on a store miss by bridges that do not fail closed.
#[async_trait]
pub trait RouteResolver: Send + Sync + 'static {
    async fn resolve(&self, prefix: &str, key: &str) -> Result<Option<String>>;
}

/// Key of the `id -> ext` entry.
#[inline]
pub fn id_key(prefix: &str, id: &str) -> String {
    format!("{prefix}:id:{id}")
}

/// Key of the `ext -> id` entry.
#[inline]
pub fn ext_key(prefix: &str, ext: &str) -> String {
    format!("{prefix}:ext:{ext}")
}

#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn remove(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.remove(key).map(|(_, v)| v))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.len())
    }
}

#[cfg(feature = "sled")]
pub use self::sled_store::SledStore;

#[cfg(feature = "sled")]
mod sled_store {
    use async_trait::async_trait;

    use super::KvStore;
    use crate::{FabricError, Result};

    #[inline]
    fn unavailable(e: sled::Error) -> FabricError {
        FabricError::Unavailable(format!("sled, {e}"))
    }

    #[inline]
    fn to_string(v: sled::IVec) -> Result<String> {
        String::from_utf8(v.to_vec()).map_err(|e| FabricError::Internal(format!("route value is not utf-8, {e}")))
    }

    /// Durable store, one sled tree per process.
    #[derive(Clone)]
    pub struct SledStore {
        db: sled::Db,
        tree: sled::Tree,
    }

    impl SledStore {
        pub fn open(path: &str, tree: &str) -> Result<Self> {
            let db = sled::Config::new().path(path).open().map_err(unavailable)?;
            let tree = db.open_tree(tree).map_err(unavailable)?;
            Ok(Self { db, tree })
        }

        pub fn flush(&self) -> Result<usize> {
            self.db.flush().map_err(unavailable)
        }

        pub fn size_on_disk(&self) -> Result<u64> {
            self.db.size_on_disk().map_err(unavailable)
        }
    }

    #[async_trait]
    impl KvStore for SledStore {
        fn name(&self) -> &str {
            "sled"
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.tree.insert(key.as_bytes(), value.as_bytes()).map_err(unavailable)?;
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.tree.get(key.as_bytes()).map_err(unavailable)?.map(to_string).transpose()
        }

        async fn remove(&self, key: &str) -> Result<Option<String>> {
            self.tree.remove(key.as_bytes()).map_err(unavailable)?.map(to_string).transpose()
        }

        async fn len(&self) -> Result<usize> {
            Ok(self.tree.len())
        }
    }
}

pub struct RouteMap {
    prefix: String,
    store: Arc<dyn KvStore>,
    resolver: Option<Arc<dyn RouteResolver>>,
    ttl: Duration,
    cache: Mutex<LruCache<String, (String, Instant)>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RouteMap {
    pub fn new<P: Into<String>>(prefix: P, store: Arc<dyn KvStore>, cfg: &RouteMapConfig) -> Self {
        let cap = NonZeroUsize::new(cfg.cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            prefix: prefix.into(),
            store,
            resolver: None,
            ttl: cfg.cache_ttl,
            cache: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Misses go to `resolver` instead of failing with NotFound.
    pub fn with_resolver(mut self, resolver: Arc<dyn RouteResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Maps `id` to `ext` and `ext` back to `id`. Mappings saved earlier
    /// for either side lose their other half.
    pub async fn save(&self, id: &str, ext: &str) -> Result<()> {
        if id.is_empty() || ext.is_empty() {
            return Err(FabricError::MalformedEntity(format!("empty {} route", self.prefix)));
        }
        let key = id_key(&self.prefix, id);
        let reverse = ext_key(&self.prefix, ext);
        if let Some(old) = self.store.get(&key).await?.filter(|old| old != ext) {
            self.unlink(&ext_key(&self.prefix, &old), id).await?;
            self.evict(&old);
        }
        if let Some(old) = self.store.get(&reverse).await?.filter(|old| old != id) {
            self.unlink(&id_key(&self.prefix, &old), ext).await?;
            self.evict(&old);
        }
        self.store.set(&key, ext).await?;
        self.store.set(&reverse, id).await?;
        self.evict(id);
        self.evict(ext);
        Ok(())
    }

    /// Looks `key` up as an id first, then as an external id. NotFound when
    /// neither the store nor a resolver knows it.
    pub async fn get(&self, key: &str) -> Result<String> {
        if let Some(v) = self.cached(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(v);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let value = match self.lookup(key).await? {
            Some(v) => v,
            None => match &self.resolver {
                Some(r) => {
                    let v = r.resolve(&self.prefix, key).await?.ok_or(FabricError::NotFound)?;
                    log::debug!("route map, resolved {}:{key} from the authoritative service", self.prefix);
                    self.save(key, &v).await?;
                    v
                }
                None => return Err(FabricError::NotFound),
            },
        };
        if !self.ttl.is_zero() {
            self.cache.lock().put(key.to_owned(), (value.clone(), Instant::now() + self.ttl));
        }
        Ok(value)
    }

    /// Removes the mapping `key` belongs to, as an id or else as an
    /// external id. A no-op when unknown.
    pub async fn remove(&self, key: &str) -> Result<()> {
        if let Some(ext) = self.store.remove(&id_key(&self.prefix, key)).await? {
            self.unlink(&ext_key(&self.prefix, &ext), key).await?;
            self.evict(&ext);
        } else if let Some(id) = self.store.remove(&ext_key(&self.prefix, key)).await? {
            self.unlink(&id_key(&self.prefix, &id), key).await?;
            self.evict(&id);
        }
        self.evict(key);
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Result<Option<String>> {
        match self.store.get(&id_key(&self.prefix, key)).await? {
            Some(v) => Ok(Some(v)),
            None => self.store.get(&ext_key(&self.prefix, key)).await,
        }
    }

    /// Removes `key` only while it still points back at `to`.
    async fn unlink(&self, key: &str, to: &str) -> Result<()> {
        if self.store.get(key).await?.as_deref() == Some(to) {
            self.store.remove(key).await?;
        }
        Ok(())
    }

    fn cached(&self, key: &str) -> Option<String> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some((v, expires)) if *expires > Instant::now() => Some(v.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    #[inline]
    fn evict(&self, key: &str) {
        self.cache.lock().pop(key);
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "prefix": self.prefix,
            "store": self.store.name(),
            "cached": self.cache.lock().len(),
            "hits": self.hits.load(Ordering::Relaxed),
            "misses": self.misses.load(Ordering::Relaxed),
        })
    }
}
