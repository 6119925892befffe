use bytes::{Bytes, BytesMut};
use prost::Message as _;

use crate::error::{DecodeError, EncodeError};

/// Canonical telemetry record.
///
/// Tag 7 is reserved for a future content-type field; decoders built from this
/// definition skip it like any other unknown tag.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct Message {
    #[prost(string, tag = "1")]
    pub channel: String,
    #[prost(string, tag = "2")]
    pub subtopic: String,
    #[prost(string, tag = "3")]
    pub publisher: String,
    #[prost(string, tag = "4")]
    pub protocol: String,
    /// Nanoseconds since epoch, assigned by the publisher facade.
    #[prost(int64, tag = "5")]
    pub created: i64,
    #[prost(bytes = "bytes", tag = "6")]
    pub payload: Bytes,
}

impl Message {
    #[inline]
    pub fn new<C, S, P>(channel: C, subtopic: S, protocol: P, payload: Bytes) -> Self
    where
        C: Into<String>,
        S: Into<String>,
        P: Into<String>,
    {
        Self {
            channel: channel.into(),
            subtopic: subtopic.into(),
            publisher: String::new(),
            protocol: protocol.into(),
            created: 0,
            payload,
        }
    }

    #[inline]
    pub fn encode_to_bytes(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    #[inline]
    pub fn decode_from(data: &[u8]) -> Result<Self, DecodeError> {
        Ok(Message::decode(data)?)
    }

    /// MQTT egress topic, `channels/<channel>/messages[/<sub>/<topic>]`.
    #[inline]
    pub fn mqtt_topic(&self) -> String {
        if self.subtopic.is_empty() {
            format!("channels/{}/messages", self.channel)
        } else {
            format!("channels/{}/messages/{}", self.channel, self.subtopic.replace('.', "/"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut m = Message::new("ch1", "temp.room1", "http", Bytes::from_static(&[0x7b]));
        m.publisher = "u1".into();
        m.created = 1_700_000_000_000_000_001;
        m
    }

    #[test]
    fn decode_inverts_encode() {
        let m = sample();
        let data = m.encode_to_bytes().unwrap();
        assert_eq!(Message::decode_from(&data).unwrap(), m);
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = sample().encode_to_bytes().unwrap();
        let b = sample().encode_to_bytes().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let m = sample();
        let mut data = m.encode_to_bytes().unwrap().to_vec();
        //tag 7, wire type 2 (length-delimited), "text/plain"
        data.push((7 << 3) | 2);
        data.push(10);
        data.extend_from_slice(b"text/plain");
        //tag 9, varint 42
        data.push(9 << 3);
        data.push(42);
        assert_eq!(Message::decode_from(&data).unwrap(), m);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Message::decode_from(&[0x0a, 0xff, 0xff]).is_err());
    }

    #[test]
    fn mqtt_topic() {
        assert_eq!(sample().mqtt_topic(), "channels/ch1/messages/temp/room1");
        let m = Message::new("ch1", "", "mqtt", Bytes::new());
        assert_eq!(m.mqtt_topic(), "channels/ch1/messages");
    }
}
