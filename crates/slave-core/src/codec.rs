//! Envelope codec (C1): turns wire bytes into a [`Message`] and back.
//!
//! The concrete format is a compact JSON object keyed by the reserved integer
//! field ids in [`crate::types::keys`]; [`crate::framer`] handles the length
//! prefix this is wrapped in on the wire. A `Codec` trait is kept as the seam so
//! an alternate wire format could be substituted without touching the
//! dispatcher or transport layers.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{Map, Number, Value as Json};

use crate::types::{keys, Message, ProtocolError, Value};

/// Encodes and decodes envelopes to/from bytes.
pub trait Codec: Send + Sync {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, ProtocolError>;
    fn decode(&self, bytes: &[u8]) -> Result<Message, ProtocolError>;
}

/// The shipped [`Codec`]: a JSON object with string-ified integer keys, per the
/// same "integer key -> string key" convention scripts see at the bridge boundary.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, ProtocolError> {
        let mut obj = Map::new();
        if let Some(v) = msg.tag {
            obj.insert(keys::TAG.to_string(), Json::from(v));
        }
        if let Some(v) = msg.scheme {
            obj.insert(keys::SCHEME.to_string(), Json::from(v));
        }
        if let Some(v) = msg.msg_type {
            obj.insert(keys::TYPE.to_string(), Json::from(v));
        }
        if !msg.session_id.is_empty() {
            obj.insert(
                keys::SESSION_ID.to_string(),
                Json::Array(msg.session_id.iter().map(|id| Json::from(*id)).collect()),
            );
        }
        if let Some(v) = msg.serial {
            obj.insert(keys::SERIAL.to_string(), Json::from(v));
        }
        obj.insert(keys::ERROR_CODE.to_string(), Json::from(msg.error_code));
        if let Some(body) = &msg.body {
            obj.insert(keys::BODY.to_string(), map_to_json(body));
        }
        if let Some(v) = &msg.host {
            obj.insert(keys::HOST.to_string(), Json::from(v.clone()));
        }
        if let Some(v) = msg.id {
            obj.insert(keys::ID.to_string(), Json::from(v));
        }
        if let Some(v) = &msg.unix_addr {
            obj.insert(keys::UNIX_ADDR.to_string(), Json::from(v.clone()));
        }
        if let Some(v) = &msg.value {
            obj.insert(keys::VALUE.to_string(), value_to_json(v));
        }
        serde_json::to_vec(&Json::Object(obj)).map_err(|_| ProtocolError::DataNotMatch)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, ProtocolError> {
        let json: Json = serde_json::from_slice(bytes).map_err(|_| ProtocolError::DataNotMatch)?;
        let obj = json.as_object().ok_or(ProtocolError::DataNotMatch)?;

        let get_i64 = |k: i64| obj.get(&k.to_string()).and_then(Json::as_i64);
        let get_str = |k: i64| {
            obj.get(&k.to_string())
                .and_then(Json::as_str)
                .map(str::to_owned)
        };

        let session_id = obj
            .get(&keys::SESSION_ID.to_string())
            .and_then(Json::as_array)
            .map(|arr| arr.iter().filter_map(Json::as_u64).collect())
            .unwrap_or_default();

        let body = obj
            .get(&keys::BODY.to_string())
            .and_then(|b| json_to_map(b));

        let value = obj.get(&keys::VALUE.to_string()).map(json_to_value);

        Ok(Message {
            tag: get_i64(keys::TAG),
            scheme: get_i64(keys::SCHEME),
            msg_type: get_i64(keys::TYPE),
            session_id,
            serial: obj.get(&keys::SERIAL.to_string()).and_then(Json::as_u64),
            error_code: get_i64(keys::ERROR_CODE).unwrap_or(0),
            body,
            host: get_str(keys::HOST),
            id: get_i64(keys::ID),
            unix_addr: get_str(keys::UNIX_ADDR),
            value,
        })
    }
}

/// Re-parse a nested body map as a full inner [`Message`] (the `Deliver` opcode's
/// body is itself an encoded envelope).
pub fn decode_inner(codec: &dyn Codec, body: &BTreeMap<i64, Value>) -> Result<Message, ProtocolError> {
    let bytes = serde_json::to_vec(&map_to_json(body)).map_err(|_| ProtocolError::DataNotMatch)?;
    codec.decode(&bytes)
}

/// Encode a [`Message`] as a `Value` map, suitable for use as the nested body
/// of a `Deliver` envelope.
pub fn message_to_body(msg: &Message) -> BTreeMap<i64, Value> {
    let mut m = BTreeMap::new();
    if let Some(v) = msg.tag {
        m.insert(keys::TAG, Value::Int(v));
    }
    if let Some(v) = msg.scheme {
        m.insert(keys::SCHEME, Value::Int(v));
    }
    if let Some(v) = msg.msg_type {
        m.insert(keys::TYPE, Value::Int(v));
    }
    if !msg.session_id.is_empty() {
        m.insert(
            keys::SESSION_ID,
            Value::Seq(msg.session_id.iter().map(|id| Value::Uint(*id)).collect()),
        );
    }
    if let Some(v) = msg.serial {
        m.insert(keys::SERIAL, Value::Uint(v));
    }
    m.insert(keys::ERROR_CODE, Value::Int(msg.error_code));
    if let Some(body) = &msg.body {
        m.insert(keys::BODY, Value::Map(body.clone()));
    }
    if let Some(v) = &msg.host {
        m.insert(keys::HOST, Value::Str(v.clone()));
    }
    m
}

fn map_to_json(map: &BTreeMap<i64, Value>) -> Json {
    let mut obj = Map::new();
    for (k, v) in map {
        obj.insert(k.to_string(), value_to_json(v));
    }
    Json::Object(obj)
}

fn json_to_map(json: &Json) -> Option<BTreeMap<i64, Value>> {
    let obj = json.as_object()?;
    let mut map = BTreeMap::new();
    for (k, v) in obj {
        if let Ok(ik) = k.parse::<i64>() {
            map.insert(ik, json_to_value(v));
        }
    }
    Some(map)
}

/// Convert a native [`Value`] into a `serde_json::Value` for wire transmission
/// or for `sys.encode`/`sys.decode` bridge calls.
pub fn value_to_json(v: &Value) -> Json {
    match v {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::Number(Number::from(*i)),
        Value::Uint(u) => Json::Number(Number::from(*u)),
        Value::Float(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
        Value::Bytes(b) => Json::String(BASE64.encode(b)),
        Value::Str(s) => Json::String(s.clone()),
        Value::Seq(seq) => Json::Array(seq.iter().map(value_to_json).collect()),
        Value::Map(m) => map_to_json(m),
    }
}

/// Convert a `serde_json::Value` back into a native [`Value`]. Integer-looking
/// string keys in nested objects are parsed back to integer keys; non-numeric
/// keys are dropped (the script boundary only round-trips integer-keyed maps).
pub fn json_to_value(json: &Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::Uint(u)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(arr) => Value::Seq(arr.iter().map(json_to_value).collect()),
        Json::Object(_) => json_to_map(json).map(Value::Map).unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageType, Scheme, Tag};

    #[test]
    fn round_trips_a_hello_envelope() {
        let codec = JsonCodec;
        let msg = Message::new(MessageType::SlaveHello)
            .with_tag(Tag::Master)
            .with_scheme(Scheme::S2S)
            .with_session_id(vec![1001]);
        let bytes = codec.encode(&msg).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back.msg_type, Some(MessageType::SlaveHello as i64));
        assert_eq!(back.session_id, vec![1001]);
    }

    #[test]
    fn decode_rejects_non_object_payload() {
        let codec = JsonCodec;
        assert!(codec.decode(b"[1,2,3]").is_err());
    }

    #[test]
    fn body_integer_keys_survive_round_trip() {
        let mut body = BTreeMap::new();
        body.insert(7, Value::Str("v".to_string()));
        body.insert(42, Value::Int(9));
        let msg = Message::new(MessageType::Deliver).with_body(body.clone());
        let codec = JsonCodec;
        let bytes = codec.encode(&msg).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back.body, Some(body));
    }
}
