//! Foundational public types for the slave-core library.
//!
//! This module defines the core data structures used throughout the worker:
//! - [`Value`] — the dynamically-typed value carried inside envelope bodies
//! - [`Message`] — the self-describing envelope exchanged with the controller/adapter
//! - [`SlaveSettings`] — configuration resolved once at startup
//! - the per-boundary error enums ([`ProtocolError`], [`ScriptError`], [`TransportError`],
//!   [`StartupError`])

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 64-bit session identifier assigned upstream by the adapter. `0` means "no session".
pub type SessionId = u64;

/// Reserved integer keys for the envelope map, matching the wire protocol's field ids.
pub mod keys {
    pub const TAG: i64 = 1;
    pub const SCHEME: i64 = 2;
    pub const TYPE: i64 = 3;
    pub const SESSION_ID: i64 = 4;
    pub const SERIAL: i64 = 5;
    pub const ERROR_CODE: i64 = 6;
    pub const BODY: i64 = 7;
    pub const HOST: i64 = 8;
    pub const ID: i64 = 9;
    pub const UNIX_ADDR: i64 = 10;
    pub const VALUE: i64 = 11;
}

/// Envelope scheme: server-to-server vs server-to-client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    S2S = 0,
    S2C = 1,
}

/// Envelope routing tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Master = 0,
    Adapter = 1,
    Slave = 2,
}

/// Envelope opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    SlaveHello = 1,
    SlaveChange = 2,
    Deliver = 3,
    KillClient = 4,
    FlowReturn = 5,
    ClientEnter = 6,
    ClientLeave = 7,
}

impl MessageType {
    pub fn from_i64(v: i64) -> Option<Self> {
        Some(match v {
            1 => Self::SlaveHello,
            2 => Self::SlaveChange,
            3 => Self::Deliver,
            4 => Self::KillClient,
            5 => Self::FlowReturn,
            6 => Self::ClientEnter,
            7 => Self::ClientLeave,
            _ => return None,
        })
    }
}

/// A dynamically-typed value at the script/wire boundary.
///
/// Mirrors the shape scripts see after marshalling: every envelope body field and
/// every bridge call argument/return value is one of these variants. Integer keys
/// inside a [`Map`](Value::Map) are stringified when crossing into script scope and
/// parsed back on the way out (lossy: a string key that looks like an integer is
/// indistinguishable from an integer key after the round trip).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    Seq(Vec<Value>),
    Map(BTreeMap<i64, Value>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<i64, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// The self-describing envelope exchanged with the controller (via TCP) and the
/// adapter (via a unix datagram socket).
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub tag: Option<i64>,
    pub scheme: Option<i64>,
    pub msg_type: Option<i64>,
    pub session_id: Vec<SessionId>,
    pub serial: Option<u64>,
    pub error_code: i64,
    pub body: Option<BTreeMap<i64, Value>>,
    pub host: Option<String>,
    pub id: Option<i64>,
    pub unix_addr: Option<String>,
    pub value: Option<Value>,
}

impl Message {
    pub fn new(msg_type: MessageType) -> Self {
        Message {
            msg_type: Some(msg_type as i64),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tag = Some(tag as i64);
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = Some(scheme as i64);
        self
    }

    pub fn with_session_id(mut self, ids: Vec<SessionId>) -> Self {
        self.session_id = ids;
        self
    }

    pub fn with_serial(mut self, serial: u64) -> Self {
        self.serial = Some(serial);
        self
    }

    pub fn with_body(mut self, body: BTreeMap<i64, Value>) -> Self {
        self.body = Some(body);
        self
    }
}

/// Configuration resolved once at startup from CLI flags.
#[derive(Debug, Clone)]
pub struct SlaveSettings {
    pub help: bool,
    pub version: bool,
    pub daemon: bool,
    pub tcp_only: bool,
    pub pprof_path: Option<String>,
    pub controller_addr: String,
    pub storage_addr: String,
    pub pool_size: usize,
    pub script_entry: String,
    pub log_dir: Option<String>,
}

impl Default for SlaveSettings {
    fn default() -> Self {
        Self {
            help: false,
            version: false,
            daemon: false,
            tcp_only: false,
            pprof_path: None,
            controller_addr: "127.0.0.1:10088".to_string(),
            storage_addr: "127.0.0.1:10099".to_string(),
            pool_size: 100,
            script_entry: "./app.py".to_string(),
            log_dir: None,
        }
    }
}

/// Errors from parsing an inbound envelope or its nested body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message body is missing or empty")]
    DataDamaged,
    #[error("inner envelope could not be decoded")]
    DataNotMatch,
}

/// Errors surfaced from a script hook invocation. Logged, never propagated past
/// the VM wrapper boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScriptError {
    SyntaxError { message: String, line: u32, col: u32 },
    RuntimeError { message: String, traceback: String },
    LoadFailed { message: String },
}

/// Transport-layer failures. Logged and swallowed; the next control-loop tick
/// re-evaluates rather than retrying at the application level.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("codec error: {0}")]
    Codec(String),
}

/// Fatal startup errors. The supervisor logs these and exits the process.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind unix socket at {path}: {source}")]
    BindUnixSocket { path: String, #[source] source: std::io::Error },
    #[error("failed to connect to controller at {addr}: {source}")]
    ConnectController { addr: String, #[source] source: std::io::Error },
    #[error("failed to create VM pool: {0}")]
    PoolInit(String),
    #[error("unsupported script engine")]
    UnsupportedEngine,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slave_settings_default_pool_size_is_100() {
        assert_eq!(SlaveSettings::default().pool_size, 100);
    }

    #[test]
    fn message_new_sets_type() {
        let msg = Message::new(MessageType::Deliver).with_tag(Tag::Adapter);
        assert_eq!(msg.msg_type, Some(MessageType::Deliver as i64));
        assert_eq!(msg.tag, Some(Tag::Adapter as i64));
    }

    #[test]
    fn value_as_i64_converts_uint() {
        assert_eq!(Value::Uint(7).as_i64(), Some(7));
        assert_eq!(Value::Str("x".into()).as_i64(), None);
    }

    #[test]
    fn message_type_from_i64_round_trips() {
        for t in [
            MessageType::SlaveHello,
            MessageType::SlaveChange,
            MessageType::Deliver,
            MessageType::KillClient,
            MessageType::FlowReturn,
            MessageType::ClientEnter,
            MessageType::ClientLeave,
        ] {
            assert_eq!(MessageType::from_i64(t as i64), Some(t));
        }
        assert_eq!(MessageType::from_i64(99), None);
    }
}
