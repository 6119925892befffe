use bytes::Bytes;

use mfabric_conf::Settings;

use crate::topic::validate_channel;
use crate::types::Message;
use crate::{FabricError, Result};

/// Ceilings enforced by [`validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_payload: usize,
    pub max_subtopic_labels: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_payload: 1024 * 1024, max_subtopic_labels: 16 }
    }
}

impl From<&Settings> for Limits {
    fn from(s: &Settings) -> Self {
        Self { max_payload: s.message.max_payload.as_usize(), max_subtopic_labels: s.message.max_subtopic_labels }
    }
}

/// Checks channel presence, the subtopic grammar and the payload ceiling.
///
/// Subtopic labels match `[a-zA-Z0-9_-]+`; an empty subtopic is legal.
pub fn validate(m: &Message, limits: &Limits) -> Result<()> {
    validate_channel(&m.channel)?;
    validate_subtopic(&m.subtopic, limits.max_subtopic_labels)?;
    if m.payload.len() > limits.max_payload {
        return Err(FabricError::PayloadTooLarge { size: m.payload.len(), max: limits.max_payload });
    }
    Ok(())
}

pub fn validate_subtopic(subtopic: &str, max_labels: usize) -> Result<()> {
    if subtopic.is_empty() {
        return Ok(());
    }
    let mut count = 0;
    for label in subtopic.split('.') {
        count += 1;
        if count > max_labels {
            return Err(FabricError::MalformedEntity(format!("subtopic has more than {max_labels} labels")));
        }
        if label.is_empty() {
            return Err(FabricError::InvalidSubtopic(format!("empty label in `{subtopic}`")));
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
            return Err(FabricError::InvalidSubtopic(format!("invalid label `{label}`")));
        }
    }
    Ok(())
}

/// Builds and validates a message, leaving `publisher` and `created` for the
/// publisher facade to stamp.
#[inline]
pub fn build(channel: &str, subtopic: &str, payload: Bytes, protocol: &str, limits: &Limits) -> Result<Message> {
    let m = Message::new(channel, subtopic, protocol, payload);
    validate(&m, limits)?;
    Ok(m)
}
