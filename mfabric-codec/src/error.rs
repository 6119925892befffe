#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed record, {0}")]
    Malformed(#[from] prost::DecodeError),
    #[error("Invalid event map, {0}")]
    InvalidMap(#[from] serde_json::Error),
    #[error("Event is not a map")]
    NotAMap,
    #[error("Missing required key `{0}`")]
    MissingKey(&'static str),
    #[error("Invalid value for key `{0}`")]
    InvalidValue(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Buffer too small, required {required}, remaining {remaining}")]
    InsufficientBuffer { required: usize, remaining: usize },
    #[error("Event map encode error, {0}")]
    Map(#[from] serde_json::Error),
}

impl From<prost::EncodeError> for EncodeError {
    fn from(e: prost::EncodeError) -> Self {
        EncodeError::InsufficientBuffer { required: e.required_capacity(), remaining: e.remaining() }
    }
}
