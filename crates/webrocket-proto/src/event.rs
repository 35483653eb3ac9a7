//! Event payloads.
//!
//! Broadcast and trigger payloads travel as a single-key JSON object:
//! `{"<event>": <data>}`. Anything else is rejected at the boundary.

use serde_json::{Map, Value};

use crate::codec::ProtocolError;

/// A named event with attached data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// The event name.
    pub name: String,
    /// Data attached to the event.
    pub data: Map<String, Value>,
}

impl Event {
    /// Build an event from a name and data object.
    pub fn new(name: impl Into<String>, data: Map<String, Value>) -> Event {
        Event {
            name: name.into(),
            data,
        }
    }

    /// Parse a `{event: data}` payload.
    ///
    /// The object must have exactly one key. Non-object data is tolerated
    /// and replaced with an empty map, matching the tolerant reader on the
    /// worker side.
    pub fn from_json(raw: &str) -> Result<Event, ProtocolError> {
        let value: Value = serde_json::from_str(raw).map_err(|_| ProtocolError::BadRequest)?;
        let object = value.as_object().ok_or(ProtocolError::BadRequest)?;
        if object.len() != 1 {
            return Err(ProtocolError::BadRequest);
        }
        let (name, data) = object.iter().next().expect("single-key object");
        let data = match data {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        Ok(Event {
            name: name.clone(),
            data,
        })
    }

    /// Serialize to the single-key wire form.
    pub fn to_json(&self) -> String {
        let mut outer = Map::new();
        outer.insert(self.name.clone(), Value::Object(self.data.clone()));
        Value::Object(outer).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_roundtrip() {
        let mut data = Map::new();
        data.insert("foo".to_string(), json!("bar"));
        let event = Event::new("test", data);
        let parsed = Event::from_json(&event.to_json()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_rejects_multi_key() {
        assert!(Event::from_json(r#"{"a":{},"b":{}}"#).is_err());
        assert!(Event::from_json(r#"{}"#).is_err());
        assert!(Event::from_json(r#"[1,2]"#).is_err());
        assert!(Event::from_json("not json").is_err());
    }

    #[test]
    fn test_non_object_data_tolerated() {
        let event = Event::from_json(r#"{"ping":42}"#).unwrap();
        assert_eq!(event.name, "ping");
        assert!(event.data.is_empty());
    }
}
