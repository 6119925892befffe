use std::fmt;

use bytestring::ByteString;
use sha2::{Digest, Sha256};

use crate::{FabricError, Result};

const BEARER_PREFIX: &str = "bearer ";
const THING_PREFIX: &str = "thing ";

/// What a caller presents on publish or subscribe.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Session or service JWT.
    Bearer(String),
    /// Device secret without a thing id, `Authorization: Thing <secret>`.
    ThingSecret(String),
    /// MQTT connect, the password is a thing secret or a bearer token.
    Mqtt { client_id: String, password: String },
    /// Device certificate fingerprint.
    CertFingerprint(String),
}

impl Credential {
    /// Parses an HTTP `Authorization` header value.
    pub fn from_authorization(header: &str) -> Result<Self> {
        let header = header.trim();
        let lower = header.to_ascii_lowercase();
        let cred = if lower.starts_with(BEARER_PREFIX) {
            Credential::Bearer(header[BEARER_PREFIX.len()..].trim().to_owned())
        } else if lower.starts_with(THING_PREFIX) {
            Credential::ThingSecret(header[THING_PREFIX.len()..].trim().to_owned())
        } else {
            return Err(FabricError::Unauthenticated("unsupported authorization scheme".into()));
        };
        if cred.secret().is_empty() {
            return Err(FabricError::Unauthenticated("empty credential".into()));
        }
        Ok(cred)
    }

    pub fn mqtt(client_id: &str, password: &[u8]) -> Result<Self> {
        let password = std::str::from_utf8(password)
            .map_err(|_| FabricError::Unauthenticated("password is not valid utf8".into()))?;
        if client_id.is_empty() || password.is_empty() {
            return Err(FabricError::Unauthenticated("missing client id or password".into()));
        }
        Ok(Credential::Mqtt { client_id: client_id.to_owned(), password: password.to_owned() })
    }

    #[inline]
    pub fn secret(&self) -> &str {
        match self {
            Credential::Bearer(s) | Credential::ThingSecret(s) | Credential::CertFingerprint(s) => s,
            Credential::Mqtt { password, .. } => password,
        }
    }

    #[inline]
    fn kind(&self) -> &'static str {
        match self {
            Credential::Bearer(_) => "bearer",
            Credential::ThingSecret(_) => "thing",
            Credential::Mqtt { .. } => "mqtt",
            Credential::CertFingerprint(_) => "cert",
        }
    }

    /// Stable digest of the credential, never the secret itself.
    pub fn fingerprint(&self) -> ByteString {
        let mut h = Sha256::new();
        h.update(self.kind().as_bytes());
        h.update(b":");
        if let Credential::Mqtt { client_id, .. } = self {
            h.update(client_id.as_bytes());
            h.update(b":");
        }
        h.update(self.secret().as_bytes());
        ByteString::from(hex::encode(&h.finalize()[..16]))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Mqtt { client_id, .. } => write!(f, "Mqtt({client_id}, ***)"),
            _ => write!(f, "{}(***)", self.kind()),
        }
    }
}

/// JWT shaped, three dot separated segments.
#[inline]
pub(crate) fn looks_like_jwt(s: &str) -> bool {
    s.split('.').count() == 3 && !s.contains(' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_header() {
        assert_eq!(Credential::from_authorization("Bearer abc").unwrap(), Credential::Bearer("abc".into()));
        assert_eq!(Credential::from_authorization("bearer  abc ").unwrap(), Credential::Bearer("abc".into()));
        assert_eq!(Credential::from_authorization("Thing s3cr3t").unwrap(), Credential::ThingSecret("s3cr3t".into()));
        assert!(Credential::from_authorization("Basic abc").is_err());
        assert!(Credential::from_authorization("Bearer ").is_err());
    }

    #[test]
    fn mqtt_credential() {
        let c = Credential::mqtt("t1", b"secret").unwrap();
        assert_eq!(c.secret(), "secret");
        assert!(Credential::mqtt("", b"secret").is_err());
        assert!(Credential::mqtt("t1", &[0xff, 0xfe]).is_err());
    }

    #[test]
    fn fingerprint_hides_secret() {
        let a = Credential::ThingSecret("secret".into());
        let b = Credential::Bearer("secret".into());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), Credential::ThingSecret("secret".into()).fingerprint());
        assert_eq!(a.fingerprint().len(), 32);
        assert!(!format!("{a:?}").contains("secret"));
    }

    #[test]
    fn jwt_shape() {
        assert!(looks_like_jwt("a.b.c"));
        assert!(!looks_like_jwt("secret"));
    }
}
