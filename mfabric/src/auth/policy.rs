use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::{DashSet, HashMap, Object, ObjectType, PolicyTuple};
use crate::{FabricError, Result};

/// External relation-tuple store consulted by the gate.
#[async_trait]
pub trait PolicyOracle: Send + Sync + 'static {
    /// True when the tuple is granted, directly or through a derived relation.
    async fn check(&self, tuple: &PolicyTuple) -> Result<bool>;

    /// Lets a denial on a missing object surface as NotFound.
    async fn object_exists(&self, _object: &Object) -> Result<bool> {
        Ok(true)
    }
}

/// In-process oracle holding tuples and the set of known objects. Objects of
/// a tuple are registered when the tuple is added.
#[derive(Default)]
pub struct MemoryPolicyOracle {
    tuples: DashSet<PolicyTuple>,
    objects: DashSet<(ObjectType, String)>,
    calls: AtomicU64,
    unreachable: AtomicBool,
    delay: RwLock<Option<Duration>>,
    owners: RwLock<HashMap<String, String>>,
}

impl MemoryPolicyOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_policy(&self, tuple: PolicyTuple) {
        self.objects.insert((tuple.object_type, tuple.object_id.to_string()));
        self.tuples.insert(tuple);
    }

    pub fn delete_policy(&self, tuple: &PolicyTuple) -> bool {
        self.tuples.remove(tuple).is_some()
    }

    pub fn add_object(&self, object: &Object) {
        self.objects.insert((object.typ, object.id.to_string()));
    }

    pub fn remove_object(&self, object: &Object) {
        self.objects.remove(&(object.typ, object.id.to_string()));
        self.tuples.retain(|t| !(t.object_type == object.typ && t.object_id == object.id));
    }

    /// Makes `owner` the owner of `channel`, owners hold every action on it.
    pub fn set_owner(&self, channel: &str, owner: &str) {
        self.objects.insert((ObjectType::Channel, channel.to_owned()));
        self.owners.write().insert(channel.to_owned(), owner.to_owned());
    }

    /// Oracle calls served so far.
    #[inline]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    async fn round_trip(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.read();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(FabricError::TransientAuth("policy oracle unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PolicyOracle for MemoryPolicyOracle {
    async fn check(&self, tuple: &PolicyTuple) -> Result<bool> {
        self.round_trip().await?;
        if self.tuples.contains(tuple) {
            return Ok(true);
        }
        let owned = tuple.object_type == ObjectType::Channel
            && self.owners.read().get(&*tuple.object_id).is_some_and(|o| *o == *tuple.subject_id);
        Ok(owned)
    }

    async fn object_exists(&self, object: &Object) -> Result<bool> {
        Ok(self.objects.contains(&(object.typ, object.id.to_string())))
    }
}
