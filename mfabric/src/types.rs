use std::fmt;
use std::str::FromStr;

use bytestring::ByteString;
use serde::{Deserialize, Serialize};

pub use mfabric_codec::{EventRecord, Message};
pub use mfabric_conf::NodeId;
pub use mfabric_utils::{Timestamp, TimestampMillis, TimestampNanos};

use crate::{FabricError, Result};

pub type ChannelId = ByteString;
pub type ThingId = ByteString;
pub type Subtopic = ByteString;
///broker subject, m.<channel>[.<label>]*
pub type Subject = ByteString;
pub type QueueGroup = ByteString;
pub type StreamId = ByteString;
pub type GroupName = ByteString;
pub type EventId = u64;

pub type DashSet<V> = dashmap::DashSet<V, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

pub const PROTOCOL_HTTP: &str = "http";
pub const PROTOCOL_MQTT: &str = "mqtt";
pub const PROTOCOL_COAP: &str = "coap";
pub const PROTOCOL_LORA: &str = "lora";
pub const PROTOCOL_OPCUA: &str = "opcua";
pub const PROTOCOL_WS: &str = "ws";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Publish,
    Subscribe,
    ReadMessages,
    ManageChannel,
    ManageThing,
    Admin,
}

impl Action {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Publish => "publish",
            Action::Subscribe => "subscribe",
            Action::ReadMessages => "read_messages",
            Action::ManageChannel => "manage_channel",
            Action::ManageThing => "manage_thing",
            Action::Admin => "admin",
        }
    }

    /// Read paths hide denials behind NotFound.
    #[inline]
    pub fn is_read(&self) -> bool {
        matches!(self, Action::Subscribe | Action::ReadMessages)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "publish" => Action::Publish,
            "subscribe" => Action::Subscribe,
            "read_messages" => Action::ReadMessages,
            "manage_channel" => Action::ManageChannel,
            "manage_thing" => Action::ManageThing,
            "admin" => Action::Admin,
            _ => return Err(FabricError::MalformedEntity(format!("unknown action `{s}`"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Channel,
    Thing,
    Domain,
    Group,
}

impl ObjectType {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Channel => "channel",
            ObjectType::Thing => "thing",
            ObjectType::Domain => "domain",
            ObjectType::Group => "group",
        }
    }
}

impl FromStr for ObjectType {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "channel" => ObjectType::Channel,
            "thing" => ObjectType::Thing,
            "domain" => ObjectType::Domain,
            "group" => ObjectType::Group,
            _ => return Err(FabricError::MalformedEntity(format!("unknown object type `{s}`"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Object {
    pub typ: ObjectType,
    pub id: ByteString,
}

impl Object {
    #[inline]
    pub fn channel<T: Into<ByteString>>(id: T) -> Self {
        Object { typ: ObjectType::Channel, id: id.into() }
    }

    #[inline]
    pub fn thing<T: Into<ByteString>>(id: T) -> Self {
        Object { typ: ObjectType::Thing, id: id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    User,
    Thing,
    Service,
}

impl SubjectType {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::User => "user",
            SubjectType::Thing => "thing",
            SubjectType::Service => "service",
        }
    }
}

impl FromStr for SubjectType {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "user" => SubjectType::User,
            "thing" => SubjectType::Thing,
            "service" => SubjectType::Service,
            _ => return Err(FabricError::MalformedEntity(format!("unknown subject type `{s}`"))),
        })
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: ByteString,
    pub typ: SubjectType,
    /// Actions the credential was scoped to, empty means unrestricted.
    pub scopes: Vec<Action>,
    /// Seconds since epoch, none for device secrets.
    pub expires_at: Option<Timestamp>,
    /// Digest of the presented credential, part of every cache key.
    pub fingerprint: ByteString,
}

impl Identity {
    #[inline]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    #[inline]
    pub fn allows(&self, action: Action) -> bool {
        self.scopes.is_empty() || self.scopes.contains(&action)
    }
}

/// The unit of authorization, `(subject_type, subject_id, relation, object_type, object_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyTuple {
    pub subject_type: SubjectType,
    pub subject_id: ByteString,
    pub relation: Action,
    pub object_type: ObjectType,
    pub object_id: ByteString,
}

impl PolicyTuple {
    #[inline]
    pub fn new(identity: &Identity, action: Action, object: &Object) -> Self {
        Self {
            subject_type: identity.typ,
            subject_id: identity.id.clone(),
            relation: action,
            object_type: object.typ,
            object_id: object.id.clone(),
        }
    }

    pub fn to_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut m = serde_json::Map::new();
        m.insert("subject_type".into(), self.subject_type.as_str().into());
        m.insert("subject_id".into(), self.subject_id.to_string().into());
        m.insert("relation".into(), self.relation.as_str().into());
        m.insert("object_type".into(), self.object_type.as_str().into());
        m.insert("object_id".into(), self.object_id.to_string().into());
        m
    }

    pub fn from_event(ev: &EventRecord) -> Result<Self> {
        let field = |key: &'static str| {
            ev.get_str(key).ok_or_else(|| FabricError::MalformedEntity(format!("policy event misses `{key}`")))
        };
        Ok(Self {
            subject_type: field("subject_type")?.parse()?,
            subject_id: ByteString::from(field("subject_id")?),
            relation: field("relation")?.parse()?,
            object_type: field("object_type")?.parse()?,
            object_id: ByteString::from(field("object_id")?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Permitted,
    Denied,
    NotFound,
}

impl Decision {
    #[inline]
    pub fn is_permitted(&self) -> bool {
        matches!(self, Decision::Permitted)
    }

    /// Maps a decision to the caller-facing result. Read paths never reveal
    /// whether a denied object exists.
    #[inline]
    pub fn check(self, action: Action) -> Result<()> {
        match self {
            Decision::Permitted => Ok(()),
            Decision::NotFound if action.is_read() => Err(FabricError::NotFound),
            Decision::Denied if action.is_read() => Err(FabricError::NotFound),
            Decision::NotFound | Decision::Denied => Err(FabricError::Forbidden),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_mapping() {
        assert_eq!(Decision::Permitted.check(Action::Publish), Ok(()));
        assert_eq!(Decision::Denied.check(Action::Publish), Err(FabricError::Forbidden));
        assert_eq!(Decision::NotFound.check(Action::Publish), Err(FabricError::Forbidden));
        assert_eq!(Decision::Denied.check(Action::ReadMessages), Err(FabricError::NotFound));
        assert_eq!(Decision::NotFound.check(Action::Subscribe), Err(FabricError::NotFound));
    }

    #[test]
    fn policy_tuple_event_fields() {
        let t = PolicyTuple {
            subject_type: SubjectType::User,
            subject_id: "u1".into(),
            relation: Action::Publish,
            object_type: ObjectType::Channel,
            object_id: "ch3".into(),
        };
        let ev = EventRecord::new("delete_policy", t.to_fields());
        assert_eq!(PolicyTuple::from_event(&ev).unwrap(), t);
        let ev = EventRecord::new("delete_policy", serde_json::Map::new());
        assert!(PolicyTuple::from_event(&ev).is_err());
    }

    #[test]
    fn identity_scopes_and_expiry() {
        let id = Identity {
            id: "u1".into(),
            typ: SubjectType::User,
            scopes: vec![Action::Subscribe],
            expires_at: Some(100),
            fingerprint: "fp".into(),
        };
        assert!(id.allows(Action::Subscribe));
        assert!(!id.allows(Action::Publish));
        assert!(!id.is_expired(99));
        assert!(id.is_expired(100));
    }
}
