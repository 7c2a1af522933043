//! Flow message helpers.
//!
//! Messages are plain JSON values. Those arriving on the primary connection come in two kinds (`json` and
//! `external_message`); those arriving on a peer data channel are `jsonMsg`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};

/// Topic stamped onto peer messages that carry none.
pub const DEFAULT_TOPIC: &str = "_";
pub const FROM_FIELD: &str = "from";
pub const TOPIC_FIELD: &str = "topic";
pub const PAYLOAD_FIELD: &str = "payload";
pub const QUERY_FIELD: &str = "query";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "external_message")]
    ExternalMessage,
    #[serde(rename = "jsonMsg")]
    PeerJson,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Json => "json",
            MessageKind::ExternalMessage => "external_message",
            MessageKind::PeerJson => "jsonMsg",
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_blank(map: &Map<String, Value>, field: &str) -> bool {
    match map.get(field) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Prepares a message for a peer data channel: a non-object value becomes `{"payload": value}`, a blank `from` is
/// set to `local` and a blank `topic` to [`DEFAULT_TOPIC`]. Fields that are already set are left alone.
pub fn stamp_peer_message(message: Value, local: &str) -> Value {
    let mut map = match message {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert(PAYLOAD_FIELD.to_string(), other);
            map
        }
    };
    if is_blank(&map, FROM_FIELD) {
        map.insert(FROM_FIELD.to_string(), Value::String(local.to_string()));
    }
    if is_blank(&map, TOPIC_FIELD) {
        map.insert(TOPIC_FIELD.to_string(), Value::String(DEFAULT_TOPIC.to_string()));
    }
    Value::Object(map)
}

/// A message headed for the HTTP relay.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Map<String, Value>>,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self { topic: Some(topic.into()), payload: Some(payload), query: None }
    }

    pub fn with_query<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.query.get_or_insert_with(Map::new).insert(key.into(), value.into());
        self
    }

    /// Picks `topic`, `payload` and `query` out of a flow message. A non-string topic is rendered as JSON text and a
    /// non-object query is ignored. A missing payload stays missing.
    pub fn from_flow(message: &Value) -> Self {
        let topic = match message.get(TOPIC_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };
        let payload = message.get(PAYLOAD_FIELD).cloned();
        let query = message.get(QUERY_FIELD).and_then(Value::as_object).cloned();
        Self { topic, payload, query }
    }

    /// Query parameters as text pairs. Strings are passed through, nulls skipped, anything else rendered as JSON.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let Some(query) = &self.query else {
            return Vec::new();
        };
        query
            .iter()
            .filter_map(|(k, v)| match v {
                Value::Null => None,
                Value::String(s) => Some((k.clone(), s.clone())),
                other => Some((k.clone(), other.to_string())),
            })
            .collect()
    }
}
