#![deny(unsafe_code)]

//! Wire codecs carried on broker subjects and event streams
//!
//! - [`Message`]: the telemetry record, a length-delimited tagged record
//!   (channel=1, subtopic=2, publisher=3, protocol=4, created=5, payload=6).
//!   Encoding is deterministic and unknown fields are skipped on decode.
//! - [`EventRecord`]: a control-plane change event rendered as a JSON map with
//!   the required keys `operation` and `occurred_at`.

/// Error types for encoding/decoding operations
pub mod error;

/// Change-event map codec
pub mod event;

/// Telemetry record codec
pub mod message;

pub use error::{DecodeError, EncodeError};
pub use event::EventRecord;
pub use message::Message;
