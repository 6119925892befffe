use mfabric_codec::{DecodeError, EncodeError};

pub type Result<T, E = FabricError> = std::result::Result<T, E>;

/// Error kinds surfaced by the fabric. Each kind maps to one wire status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Auth,
    NotFound,
    Conflict,
    Resource,
    Fatal,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FabricError {
    #[error("malformed entity, {0}")]
    MalformedEntity(String),
    #[error("payload too large, {size} bytes exceeds {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("invalid subtopic, {0}")]
    InvalidSubtopic(String),
    #[error("unauthenticated, {0}")]
    Unauthenticated(String),
    #[error("forbidden")]
    Forbidden,
    #[error("authorization temporarily unavailable, {0}")]
    TransientAuth(String),
    #[error("not found")]
    NotFound,
    #[error("conflict, {0}")]
    Conflict(String),
    #[error("overloaded, recovery queue is full")]
    Overloaded,
    #[error("timeout")]
    Timeout,
    #[error("unavailable, {0}")]
    Unavailable(String),
    #[error("drain timeout, subscription closed with handlers still running")]
    DrainTimeout,
    #[error("signing key unavailable, {0}")]
    SigningKey(String),
    #[error("broker unreachable at startup, {0}")]
    BrokerUnreachable(String),
    #[error("internal error, {0}")]
    Internal(String),
}

impl FabricError {
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        match self {
            FabricError::MalformedEntity(_)
            | FabricError::PayloadTooLarge { .. }
            | FabricError::InvalidSubtopic(_) => ErrorKind::Input,
            FabricError::Unauthenticated(_) | FabricError::Forbidden | FabricError::TransientAuth(_) => {
                ErrorKind::Auth
            }
            FabricError::NotFound => ErrorKind::NotFound,
            FabricError::Conflict(_) => ErrorKind::Conflict,
            FabricError::Overloaded
            | FabricError::Timeout
            | FabricError::Unavailable(_)
            | FabricError::DrainTimeout => ErrorKind::Resource,
            FabricError::SigningKey(_) | FabricError::BrokerUnreachable(_) => ErrorKind::Fatal,
            FabricError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status surfaced to callers.
    #[inline]
    pub fn status_code(&self) -> u16 {
        match self {
            FabricError::MalformedEntity(_) | FabricError::InvalidSubtopic(_) => 400,
            FabricError::PayloadTooLarge { .. } => 413,
            FabricError::Unauthenticated(_) => 401,
            FabricError::Forbidden => 403,
            FabricError::NotFound => 404,
            FabricError::Conflict(_) => 409,
            FabricError::Overloaded => 429,
            FabricError::TransientAuth(_) | FabricError::Unavailable(_) | FabricError::BrokerUnreachable(_) => 503,
            FabricError::Timeout | FabricError::DrainTimeout => 504,
            FabricError::SigningKey(_) | FabricError::Internal(_) => 500,
        }
    }

    /// Any input-kind error, the family callers see as a malformed request.
    #[inline]
    pub fn is_malformed(&self) -> bool {
        self.kind() == ErrorKind::Input
    }

    /// Retrying inside the core is allowed for these only.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, FabricError::TransientAuth(_) | FabricError::Timeout | FabricError::Unavailable(_))
    }
}

impl From<DecodeError> for FabricError {
    fn from(e: DecodeError) -> Self {
        FabricError::MalformedEntity(e.to_string())
    }
}

impl From<EncodeError> for FabricError {
    fn from(e: EncodeError) -> Self {
        FabricError::Internal(e.to_string())
    }
}

impl From<anyhow::Error> for FabricError {
    fn from(e: anyhow::Error) -> Self {
        FabricError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for FabricError {
    fn from(e: serde_json::Error) -> Self {
        FabricError::MalformedEntity(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for FabricError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        FabricError::Timeout
    }
}
