use std::time::Duration;

use jsonwebtoken::{decode, decode_header, encode, errors::ErrorKind as JwtErrorKind};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use mfabric_conf::{SigningKey, Token};
use mfabric_utils::timestamp_secs;

use crate::types::{Action, Identity, SubjectType, Timestamp};
use crate::{FabricError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub iat: Timestamp,
    pub exp: Timestamp,
    /// Space separated actions, absent means unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default = "Claims::typ_default")]
    pub typ: SubjectType,
}

impl Claims {
    fn typ_default() -> SubjectType {
        SubjectType::User
    }
}

#[derive(Clone)]
struct Key {
    id: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Key {
    fn new(k: &SigningKey) -> Option<Self> {
        if k.secret.is_empty() {
            return None;
        }
        Some(Self {
            id: k.id.clone(),
            encoding: EncodingKey::from_secret(k.secret.as_bytes()),
            decoding: DecodingKey::from_secret(k.secret.as_bytes()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub kid: String,
    pub alg: String,
    pub status: KeyStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Retiring,
}

/// Signing keys for bearer tokens. Verification accepts the active key and,
/// during a rotation window, the retiring one; issuance always uses the
/// active key.
#[derive(Clone)]
pub struct KeyRing {
    issuer: String,
    access_ttl: Duration,
    active: Option<Key>,
    retiring: Option<Key>,
}

impl KeyRing {
    pub fn new(cfg: &Token) -> Self {
        Self {
            issuer: cfg.issuer.clone(),
            access_ttl: cfg.access_ttl,
            active: Key::new(&cfg.active_key),
            retiring: cfg.retiring_key.as_ref().and_then(Key::new),
        }
    }

    /// A ring where `next` becomes active and the current active key retires.
    pub fn rotate(&self, next: &SigningKey) -> Result<Self> {
        let active = Key::new(next).ok_or_else(|| FabricError::SigningKey("rotation key has no secret".into()))?;
        Ok(Self {
            issuer: self.issuer.clone(),
            access_ttl: self.access_ttl,
            active: Some(active),
            retiring: self.active.clone(),
        })
    }

    /// Drops the retiring key, ending the rotation window.
    pub fn retire(mut self) -> Self {
        self.retiring = None;
        self
    }

    #[inline]
    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn issue(&self, subject: &str, typ: SubjectType, scopes: &[Action]) -> Result<String> {
        self.issue_with_ttl(subject, typ, scopes, self.access_ttl)
    }

    pub fn issue_with_ttl(&self, subject: &str, typ: SubjectType, scopes: &[Action], ttl: Duration) -> Result<String> {
        let key = self.active.as_ref().ok_or_else(|| FabricError::SigningKey("no active signing key".into()))?;
        let now = timestamp_secs();
        let claims = Claims {
            sub: subject.to_owned(),
            iss: self.issuer.clone(),
            iat: now,
            exp: now + ttl.as_secs() as Timestamp,
            scope: if scopes.is_empty() {
                None
            } else {
                Some(scopes.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(" "))
            },
            typ,
        };
        let header = Header { kid: Some(key.id.clone()), ..Header::new(Algorithm::HS256) };
        encode(&header, &claims, &key.encoding).map_err(|e| FabricError::SigningKey(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<Identity> {
        if self.active.is_none() && self.retiring.is_none() {
            return Err(FabricError::SigningKey("no verification key".into()));
        }
        let header =
            decode_header(token).map_err(|e| FabricError::Unauthenticated(format!("invalid token, {e}")))?;
        if header.alg != Algorithm::HS256 {
            return Err(FabricError::Unauthenticated("unsupported token algorithm".into()));
        }

        let keys = [self.active.as_ref(), self.retiring.as_ref()];
        let candidates = keys.iter().flatten().filter(|k| match header.kid.as_deref() {
            Some(kid) => k.id == kid,
            None => true,
        });

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);

        let mut last = FabricError::Unauthenticated("unknown signing key".into());
        for key in candidates {
            match decode::<Claims>(token, &key.decoding, &validation) {
                Ok(data) => return Ok(Self::identity(data.claims, token)),
                Err(e) if *e.kind() == JwtErrorKind::ExpiredSignature => {
                    return Err(FabricError::Unauthenticated("token expired".into()))
                }
                Err(e) => last = FabricError::Unauthenticated(format!("invalid token, {e}")),
            }
        }
        Err(last)
    }

    fn identity(claims: Claims, token: &str) -> Identity {
        let scopes = claims
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().filter_map(|a| a.parse::<Action>().ok()).collect())
            .unwrap_or_default();
        Identity {
            id: claims.sub.into(),
            typ: claims.typ,
            scopes,
            expires_at: Some(claims.exp),
            fingerprint: super::Credential::Bearer(token.to_owned()).fingerprint(),
        }
    }

    /// Key ids currently accepted, without key material.
    pub fn jwks(&self) -> Vec<KeyInfo> {
        let mut keys = Vec::new();
        if let Some(k) = &self.active {
            keys.push(KeyInfo { kid: k.id.clone(), alg: "HS256".into(), status: KeyStatus::Active });
        }
        if let Some(k) = &self.retiring {
            keys.push(KeyInfo { kid: k.id.clone(), alg: "HS256".into(), status: KeyStatus::Retiring });
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(active: (&str, &str), retiring: Option<(&str, &str)>) -> Token {
        Token {
            issuer: "test".into(),
            access_ttl: Duration::from_secs(60),
            active_key: SigningKey { id: active.0.into(), secret: active.1.into() },
            retiring_key: retiring.map(|(id, secret)| SigningKey { id: id.into(), secret: secret.into() }),
        }
    }

    #[test]
    fn issue_and_verify() {
        let ring = KeyRing::new(&cfg(("k1", "s1"), None));
        let tok = ring.issue("u1", SubjectType::User, &[Action::Publish, Action::Subscribe]).unwrap();
        let id = ring.verify(&tok).unwrap();
        assert_eq!(id.id, "u1");
        assert_eq!(id.typ, SubjectType::User);
        assert_eq!(id.scopes, vec![Action::Publish, Action::Subscribe]);
        assert!(id.expires_at.unwrap() > timestamp_secs());
    }

    #[test]
    fn rotation_window() {
        let old = KeyRing::new(&cfg(("k1", "s1"), None));
        let old_tok = old.issue("u1", SubjectType::User, &[]).unwrap();

        let ring = old.rotate(&SigningKey { id: "k2".into(), secret: "s2".into() }).unwrap();
        assert!(ring.verify(&old_tok).is_ok());
        let new_tok = ring.issue("u1", SubjectType::User, &[]).unwrap();
        assert_eq!(decode_header(&new_tok).unwrap().kid.as_deref(), Some("k2"));
        assert_eq!(
            ring.jwks().iter().map(|k| (k.kid.as_str(), k.status)).collect::<Vec<_>>(),
            vec![("k2", KeyStatus::Active), ("k1", KeyStatus::Retiring)]
        );

        let ring = ring.retire();
        assert!(matches!(ring.verify(&old_tok), Err(FabricError::Unauthenticated(_))));
        assert!(ring.verify(&new_tok).is_ok());
        assert_eq!(ring.jwks().len(), 1);
    }

    #[test]
    fn retiring_key_from_config() {
        let old = KeyRing::new(&cfg(("k1", "s1"), None));
        let tok = old.issue("svc", SubjectType::Service, &[]).unwrap();
        let ring = KeyRing::new(&cfg(("k2", "s2"), Some(("k1", "s1"))));
        assert_eq!(ring.verify(&tok).unwrap().typ, SubjectType::Service);
    }

    #[test]
    fn rejects_foreign_and_expired() {
        let ring = KeyRing::new(&cfg(("k1", "s1"), None));
        let other = KeyRing::new(&cfg(("k1", "other"), None));
        let tok = other.issue("u1", SubjectType::User, &[]).unwrap();
        assert!(matches!(ring.verify(&tok), Err(FabricError::Unauthenticated(_))));
        assert!(matches!(ring.verify("not-a-token"), Err(FabricError::Unauthenticated(_))));

        let claims = Claims {
            sub: "u1".into(),
            iss: "test".into(),
            iat: timestamp_secs() - 120,
            exp: timestamp_secs() - 60,
            scope: None,
            typ: SubjectType::User,
        };
        let header = Header { kid: Some("k1".into()), ..Header::new(Algorithm::HS256) };
        let expired = encode(&header, &claims, &EncodingKey::from_secret(b"s1")).unwrap();
        assert_eq!(ring.verify(&expired), Err(FabricError::Unauthenticated("token expired".into())));
    }

    #[test]
    fn missing_signing_key() {
        let ring = KeyRing::new(&cfg(("k1", ""), None));
        assert!(!ring.has_active());
        assert!(matches!(ring.issue("u1", SubjectType::User, &[]), Err(FabricError::SigningKey(_))));
        assert!(matches!(ring.verify("a.b.c"), Err(FabricError::SigningKey(_))));
    }
}
