use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::{DecodeError, EncodeError};

pub const KEY_OPERATION: &str = "operation";
pub const KEY_OCCURRED_AT: &str = "occurred_at";
pub const KEY_EVENT_ID: &str = "event_id";

/// A control-plane change event.
///
/// On the wire it is one flat JSON object: `operation`, `occurred_at`,
/// `event_id` and the operation-specific fields side by side.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Per-stream monotonic id, 0 until the log assigns one.
    pub event_id: u64,
    pub operation: String,
    /// Nanoseconds since epoch.
    pub occurred_at: i64,
    pub fields: Map<String, Value>,
}

impl EventRecord {
    #[inline]
    pub fn new<O: Into<String>>(operation: O, fields: Map<String, Value>) -> Self {
        Self { event_id: 0, operation: operation.into(), occurred_at: 0, fields }
    }

    #[inline]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    /// String list field, a JSON array of strings or a comma separated string.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.fields.get(key) {
            Some(Value::Array(items)) => {
                items.iter().filter_map(|v| v.as_str().map(String::from)).collect()
            }
            Some(Value::String(s)) => {
                s.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()).map(String::from).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = self.fields.clone();
        map.insert(KEY_OPERATION.into(), Value::String(self.operation.clone()));
        map.insert(KEY_OCCURRED_AT.into(), Value::from(self.occurred_at));
        map.insert(KEY_EVENT_ID.into(), Value::from(self.event_id));
        map
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        Ok(Bytes::from(serde_json::to_vec(&Value::Object(self.to_map()))?))
    }

    pub fn from_map(mut map: Map<String, Value>) -> Result<Self, DecodeError> {
        let operation = match map.remove(KEY_OPERATION) {
            Some(Value::String(op)) if !op.is_empty() => op,
            Some(_) => return Err(DecodeError::InvalidValue(KEY_OPERATION)),
            None => return Err(DecodeError::MissingKey(KEY_OPERATION)),
        };
        let occurred_at = match map.remove(KEY_OCCURRED_AT) {
            Some(v) => to_i64(&v).ok_or(DecodeError::InvalidValue(KEY_OCCURRED_AT))?,
            None => return Err(DecodeError::MissingKey(KEY_OCCURRED_AT)),
        };
        let event_id = match map.remove(KEY_EVENT_ID) {
            Some(v) => to_i64(&v).and_then(|id| u64::try_from(id).ok()).ok_or(DecodeError::InvalidValue(KEY_EVENT_ID))?,
            None => 0,
        };
        Ok(Self { event_id, operation, occurred_at, fields: map })
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        match serde_json::from_slice::<Value>(data)? {
            Value::Object(map) => Self::from_map(map),
            _ => Err(DecodeError::NotAMap),
        }
    }
}

//Keys are stringly typed on some producers, numbers may arrive quoted
#[inline]
fn to_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn map_round_trip() {
        let mut fields = Map::new();
        fields.insert("thing_id".into(), json!("t9"));
        fields.insert("channels".into(), json!(["c1", "c2"]));
        let mut ev = EventRecord::new("config.create", fields);
        ev.event_id = 3;
        ev.occurred_at = 42;
        let data = ev.encode().unwrap();
        let decoded = EventRecord::decode(&data).unwrap();
        assert_eq!(decoded, ev);
        assert_eq!(decoded.get_str("thing_id"), Some("t9"));
        assert_eq!(decoded.get_str_list("channels"), vec!["c1".to_string(), "c2".to_string()]);
    }

    #[test]
    fn required_keys() {
        let err = EventRecord::decode(br#"{"occurred_at":1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingKey("operation")));
        let err = EventRecord::decode(br#"{"operation":"thing.create"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingKey("occurred_at")));
        assert!(matches!(EventRecord::decode(b"[1,2]").unwrap_err(), DecodeError::NotAMap));
    }

    #[test]
    fn tolerates_unknown_and_quoted_values() {
        let ev =
            EventRecord::decode(br#"{"operation":"thing.remove","occurred_at":"17","id":"t1","extra":{"a":1}}"#)
                .unwrap();
        assert_eq!(ev.occurred_at, 17);
        assert_eq!(ev.event_id, 0);
        assert_eq!(ev.get_str("id"), Some("t1"));
        assert!(ev.fields.contains_key("extra"));
        assert_eq!(ev.get_str_list("missing"), Vec::<String>::new());
    }

    #[test]
    fn comma_separated_list() {
        let ev = EventRecord::decode(br#"{"operation":"o","occurred_at":1,"channels":"c1, c2,"}"#).unwrap();
        assert_eq!(ev.get_str_list("channels"), vec!["c1".to_string(), "c2".to_string()]);
    }
}
