//! Authorization Gate.
//!
//! Turns a presented [`Credential`] into an [`Identity`] and answers whether
//! that identity may perform an [`Action`] on an [`Object`]. Decisions come
//! from a [`PolicyOracle`] and are cached per credential; concurrent misses on
//! the same key share one oracle call.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use subtle::ConstantTimeEq;

use mfabric_conf::{Auth, SigningKey};
use mfabric_utils::timestamp_secs;

use crate::eventlog::{OP_ADD_POLICY, OP_DELETE_POLICY};
use crate::types::{Action, Decision, EventRecord, Identity, Object, PolicyTuple, SubjectType};
use crate::{FabricError, Result};

pub use self::cache::{CacheKey, DecisionCache};
pub use self::credential::Credential;
pub use self::policy::{MemoryPolicyOracle, PolicyOracle};
pub use self::things::{MemoryThingRepository, ThingRepository};
pub use self::token::{Claims, KeyInfo, KeyRing, KeyStatus};

pub mod cache;
pub mod credential;
pub mod policy;
pub mod singleflight;
pub mod things;
pub mod token;

pub struct AuthGate {
    cfg: Auth,
    keys: RwLock<Arc<KeyRing>>,
    oracle: Arc<dyn PolicyOracle>,
    things: Arc<dyn ThingRepository>,
    cache: DecisionCache,
    inflight: singleflight::Group<CacheKey, Result<Decision>>,
}

impl AuthGate {
    pub fn new(cfg: Auth, oracle: Arc<dyn PolicyOracle>, things: Arc<dyn ThingRepository>) -> Self {
        let cache = DecisionCache::new(cfg.cache_capacity, cfg.cache_shards, cfg.cache_ttl, cfg.negative_cache_ttl);
        let keys = KeyRing::new(&cfg.token);
        if !keys.has_active() {
            log::warn!("auth, no active signing key, bearer tokens cannot be issued");
        }
        Self {
            cfg,
            keys: RwLock::new(Arc::new(keys)),
            oracle,
            things,
            cache,
            inflight: singleflight::Group::new(),
        }
    }

    #[inline]
    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    #[inline]
    fn keys(&self) -> Arc<KeyRing> {
        self.keys.read().clone()
    }

    pub async fn authenticate(&self, cred: &Credential) -> Result<Identity> {
        match cred {
            Credential::Bearer(token) => self.keys().verify(token),
            Credential::ThingSecret(secret) => {
                let id = self.things.identify(secret).await.map_err(unknown_thing)?;
                Ok(thing_identity(id.to_string(), cred))
            }
            Credential::Mqtt { password, .. } if credential::looks_like_jwt(password) => {
                self.keys().verify(password)
            }
            Credential::Mqtt { client_id, password } => {
                let stored = self.things.secret_of(client_id).await.map_err(unknown_thing)?;
                if bool::from(stored.as_bytes().ct_eq(password.as_bytes())) {
                    Ok(thing_identity(client_id.clone(), cred))
                } else {
                    Err(FabricError::Unauthenticated("invalid thing credential".into()))
                }
            }
            Credential::CertFingerprint(fp) => {
                let id = self.things.identify_by_fingerprint(fp).await.map_err(unknown_thing)?;
                Ok(thing_identity(id.to_string(), cred))
            }
        }
    }

    /// Decision for `identity` performing `action` on `object`. An identity
    /// that expired since it was authenticated is rejected here.
    pub async fn authorize(&self, identity: &Identity, action: Action, object: &Object) -> Result<Decision> {
        if identity.is_expired(timestamp_secs()) {
            return Err(FabricError::Unauthenticated("credential expired".into()));
        }
        if !identity.allows(action) {
            log::debug!("auth, {} is not scoped for {}", identity.id, action);
            return Ok(Decision::Denied);
        }

        let key = CacheKey { tuple: PolicyTuple::new(identity, action, object), fingerprint: identity.fingerprint.clone() };
        if let Some(d) = self.cache.get(&key) {
            return Ok(d);
        }

        let tuple = key.tuple.clone();
        self.inflight
            .work(key.clone(), || async move {
                if let Some(d) = self.cache.get(&key) {
                    return Ok(d);
                }
                let d = self.lookup(&tuple).await?;
                self.cache.put(key, d);
                Ok(d)
            })
            .await
    }

    /// Authenticates and authorizes in one step, mapping the decision to the
    /// caller-facing error for `action`.
    pub async fn require(&self, cred: &Credential, action: Action, object: &Object) -> Result<Identity> {
        let identity = self.authenticate(cred).await?;
        self.authorize(&identity, action, object).await?.check(action)?;
        Ok(identity)
    }

    async fn lookup(&self, tuple: &PolicyTuple) -> Result<Decision> {
        let object = Object { typ: tuple.object_type, id: tuple.object_id.clone() };
        let mut backoff = self.cfg.oracle_retry_backoff;
        let mut last = String::new();
        for attempt in 0..=self.cfg.oracle_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(1));
            }
            match self.ask(tuple, &object).await {
                Ok(d) => return Ok(d),
                Err(e) if e.is_transient() => {
                    log::debug!("auth, oracle attempt {} failed, {}", attempt + 1, e);
                    last = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }
        log::warn!("auth, policy oracle unavailable after {} attempts, {}", self.cfg.oracle_retries + 1, last);
        Err(FabricError::TransientAuth(last))
    }

    async fn ask(&self, tuple: &PolicyTuple, object: &Object) -> Result<Decision> {
        let timeout = self.cfg.oracle_timeout;
        if tokio::time::timeout(timeout, self.oracle.check(tuple)).await?? {
            return Ok(Decision::Permitted);
        }
        if tokio::time::timeout(timeout, self.oracle.object_exists(object)).await?? {
            Ok(Decision::Denied)
        } else {
            Ok(Decision::NotFound)
        }
    }

    pub fn issue_token(&self, subject: &str, typ: SubjectType, scopes: &[Action]) -> Result<String> {
        self.keys().issue(subject, typ, scopes)
    }

    #[inline]
    pub fn jwks(&self) -> Vec<KeyInfo> {
        self.keys().jwks()
    }

    /// Makes `next` the active key, the current one keeps verifying until
    /// [`AuthGate::retire_key`].
    pub fn rotate_keys(&self, next: &SigningKey) -> Result<()> {
        let mut keys = self.keys.write();
        let rotated = keys.rotate(next)?;
        *keys = Arc::new(rotated);
        log::info!("auth, signing key rotated to {}", next.id);
        Ok(())
    }

    pub fn retire_key(&self) {
        let mut keys = self.keys.write();
        let ring = KeyRing::clone(&keys).retire();
        *keys = Arc::new(ring);
        log::info!("auth, retiring signing key dropped");
    }

    #[inline]
    pub fn invalidate(&self, tuple: &PolicyTuple) -> usize {
        self.cache.invalidate(tuple)
    }

    /// Applies an `add_policy`/`delete_policy` event from the policies stream.
    pub fn apply_policy_event(&self, ev: &EventRecord) -> Result<()> {
        match ev.operation.as_str() {
            OP_ADD_POLICY | OP_DELETE_POLICY => {
                let tuple = PolicyTuple::from_event(ev)?;
                let n = self.invalidate(&tuple);
                log::info!(
                    "auth, {} for {}:{} on {}:{}, {} cached decisions dropped",
                    ev.operation,
                    tuple.subject_type.as_str(),
                    tuple.subject_id,
                    tuple.object_type.as_str(),
                    tuple.object_id,
                    n
                );
            }
            op => log::debug!("auth, ignoring policies event {op}"),
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "cache": self.cache.to_json(),
            "inflight": self.inflight.in_flight(),
            "keys": self.jwks(),
        })
    }
}

#[inline]
fn unknown_thing(e: FabricError) -> FabricError {
    match e {
        FabricError::NotFound => FabricError::Unauthenticated("unknown thing credential".into()),
        e => e,
    }
}

#[inline]
fn thing_identity(id: String, cred: &Credential) -> Identity {
    Identity { id: id.into(), typ: SubjectType::Thing, scopes: Vec::new(), expires_at: None, fingerprint: cred.fingerprint() }
}
