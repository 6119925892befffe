use async_trait::async_trait;
use subtle::ConstantTimeEq;

use crate::types::{DashMap, ThingId};
use crate::{FabricError, Result};

/// Opaque repository over the thing records of the system of record.
#[async_trait]
pub trait ThingRepository: Send + Sync + 'static {
    /// Thing owning `secret`, NotFound when none does.
    async fn identify(&self, secret: &str) -> Result<ThingId>;

    /// Stored secret of a thing, NotFound when the thing is unknown.
    async fn secret_of(&self, thing_id: &str) -> Result<String>;

    /// Thing bound to a device certificate fingerprint.
    async fn identify_by_fingerprint(&self, fingerprint: &str) -> Result<ThingId>;
}

#[derive(Debug, Clone)]
struct Thing {
    secret: String,
    cert_fingerprint: Option<String>,
}

#[derive(Default)]
pub struct MemoryThingRepository {
    things: DashMap<ThingId, Thing>,
}

impl MemoryThingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, id: &str, secret: &str) -> Result<()> {
        if secret.is_empty() {
            return Err(FabricError::MalformedEntity("empty thing secret".into()));
        }
        if self.things.iter().any(|t| ct_eq(&t.secret, secret)) {
            return Err(FabricError::Conflict("thing secret already in use".into()));
        }
        match self.things.entry(ThingId::from(id)) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(FabricError::Conflict(format!("thing `{id}` exists"))),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Thing { secret: secret.to_owned(), cert_fingerprint: None });
                Ok(())
            }
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.things.remove(id).is_some()
    }

    pub fn bind_certificate(&self, id: &str, fingerprint: &str) -> Result<()> {
        let mut t = self.things.get_mut(id).ok_or(FabricError::NotFound)?;
        t.cert_fingerprint = Some(fingerprint.to_ascii_lowercase());
        Ok(())
    }
}

#[inline]
fn ct_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[async_trait]
impl ThingRepository for MemoryThingRepository {
    async fn identify(&self, secret: &str) -> Result<ThingId> {
        //every record is compared so timing does not depend on the position
        let mut found = None;
        for t in self.things.iter() {
            if ct_eq(&t.secret, secret) {
                found = Some(t.key().clone());
            }
        }
        found.ok_or(FabricError::NotFound)
    }

    async fn secret_of(&self, thing_id: &str) -> Result<String> {
        self.things.get(thing_id).map(|t| t.secret.clone()).ok_or(FabricError::NotFound)
    }

    async fn identify_by_fingerprint(&self, fingerprint: &str) -> Result<ThingId> {
        let fingerprint = fingerprint.to_ascii_lowercase();
        self.things
            .iter()
            .find(|t| t.cert_fingerprint.as_deref() == Some(fingerprint.as_str()))
            .map(|t| t.key().clone())
            .ok_or(FabricError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_identify() {
        let repo = MemoryThingRepository::new();
        repo.create("t7", "dev-secret-X").unwrap();
        assert!(matches!(repo.create("t7", "other"), Err(FabricError::Conflict(_))));
        assert!(matches!(repo.create("t8", "dev-secret-X"), Err(FabricError::Conflict(_))));

        assert_eq!(repo.identify("dev-secret-X").await.unwrap(), "t7");
        assert_eq!(repo.identify("nope").await, Err(FabricError::NotFound));
        assert_eq!(repo.secret_of("t7").await.unwrap(), "dev-secret-X");

        repo.bind_certificate("t7", "AB:CD").unwrap();
        assert_eq!(repo.identify_by_fingerprint("ab:cd").await.unwrap(), "t7");

        assert!(repo.remove("t7"));
        assert_eq!(repo.secret_of("t7").await, Err(FabricError::NotFound));
    }
}
