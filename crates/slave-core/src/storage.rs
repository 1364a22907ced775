//! The `Storage` seam (external storage daemon client): global locks, the
//! relational query/exec surface, and the Redis-style key/value surface.
//!
//! Every operation is a synchronous request/response with a 5-second timeout,
//! because bridge calls run on a pool slot's plain OS thread (not inside the
//! async runtime) and must block that thread until the daemon answers.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{SessionId, Value};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure sentinel returned by lock acquisition when the daemon refuses or is
/// unreachable.
pub const LOCK_FAILED: i64 = 0;
/// Sentinel returned by `unlock` when the default key was requested but no
/// serial is currently held.
pub const UNLOCK_NO_HANDLE: i64 = -1;

#[derive(Debug, Serialize)]
#[serde(tag = "op")]
enum Request<'a> {
    InitLock { key: u64 },
    DisposeLock { key: u64 },
    Lock { key: u64 },
    Unlock { key: u64, serial: i64 },
    Query { sql: &'a str, args: &'a [Value] },
    Exec { sql: &'a str, args: &'a [Value] },
    RedisCmd { key: u64, name: &'a str, args: &'a [Value] },
}

#[derive(Debug, Deserialize)]
struct Response {
    ok: bool,
    serial: Option<i64>,
    rows: Option<Vec<std::collections::BTreeMap<String, Value>>>,
    affected: Option<u64>,
    value: Option<Value>,
}

/// Client seam to the external storage daemon. Implementations must tolerate
/// the daemon being absent: every method returns a failure sentinel rather
/// than propagating an error up into script execution.
pub trait Storage: Send + Sync {
    fn init_lock(&self, key: SessionId) -> bool;
    fn dispose_lock(&self, key: SessionId) -> bool;
    fn lock(&self, key: u64) -> i64;
    fn unlock(&self, key: u64, serial: i64) -> i64;
    fn query(&self, sql: &str, args: &[Value]) -> Option<Vec<std::collections::BTreeMap<String, Value>>>;
    fn exec(&self, sql: &str, args: &[Value]) -> u64;
    fn redis_cmd(&self, key: u64, name: &str, args: &[Value]) -> Option<Value>;
}

/// TCP-backed client talking a line-delimited JSON request/response protocol
/// to the storage daemon. Reconnects lazily on the next call after a failure.
pub struct RemoteStorage {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
}

impl RemoteStorage {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), conn: Mutex::new(None) }
    }

    fn with_connection<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut TcpStream) -> std::io::Result<R>,
    {
        let mut guard = self.conn.lock().expect("storage connection mutex poisoned");
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr).ok()?;
            stream.set_read_timeout(Some(CALL_TIMEOUT)).ok()?;
            stream.set_write_timeout(Some(CALL_TIMEOUT)).ok()?;
            *guard = Some(stream);
        }
        let stream = guard.as_mut()?;
        match f(stream) {
            Ok(v) => Some(v),
            Err(_) => {
                *guard = None;
                None
            }
        }
    }

    fn call(&self, req: &Request) -> Option<Response> {
        self.with_connection(|stream| {
            let mut line = serde_json::to_vec(req)?;
            line.push(b'\n');
            stream.write_all(&line)?;
            let mut reader = std::io::BufReader::new(stream.try_clone()?);
            let mut buf = String::new();
            std::io::BufRead::read_line(&mut reader, &mut buf)?;
            serde_json::from_str(buf.trim_end())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }
}

impl Storage for RemoteStorage {
    fn init_lock(&self, key: SessionId) -> bool {
        self.call(&Request::InitLock { key }).map(|r| r.ok).unwrap_or(false)
    }

    fn dispose_lock(&self, key: SessionId) -> bool {
        self.call(&Request::DisposeLock { key }).map(|r| r.ok).unwrap_or(false)
    }

    fn lock(&self, key: u64) -> i64 {
        self.call(&Request::Lock { key })
            .filter(|r| r.ok)
            .and_then(|r| r.serial)
            .unwrap_or(LOCK_FAILED)
    }

    fn unlock(&self, key: u64, serial: i64) -> i64 {
        self.call(&Request::Unlock { key, serial })
            .filter(|r| r.ok)
            .map(|_| 0)
            .unwrap_or(LOCK_FAILED)
    }

    fn query(&self, sql: &str, args: &[Value]) -> Option<Vec<std::collections::BTreeMap<String, Value>>> {
        self.call(&Request::Query { sql, args }).filter(|r| r.ok).and_then(|r| r.rows)
    }

    fn exec(&self, sql: &str, args: &[Value]) -> u64 {
        self.call(&Request::Exec { sql, args })
            .filter(|r| r.ok)
            .and_then(|r| r.affected)
            .unwrap_or(0)
    }

    fn redis_cmd(&self, key: u64, name: &str, args: &[Value]) -> Option<Value> {
        self.call(&Request::RedisCmd { key, name, args })
            .filter(|r| r.ok)
            .and_then(|r| r.value)
    }
}

/// A storage stub that refuses every call, for tests and for the case where
/// no storage daemon address was configured. Every method returns its
/// documented failure sentinel, matching what a genuinely unreachable daemon
/// would produce from a bridge call's point of view.
#[derive(Debug, Default)]
pub struct NullStorage;

impl Storage for NullStorage {
    fn init_lock(&self, _key: SessionId) -> bool {
        false
    }
    fn dispose_lock(&self, _key: SessionId) -> bool {
        false
    }
    fn lock(&self, _key: u64) -> i64 {
        LOCK_FAILED
    }
    fn unlock(&self, _key: u64, _serial: i64) -> i64 {
        UNLOCK_NO_HANDLE
    }
    fn query(&self, _sql: &str, _args: &[Value]) -> Option<Vec<std::collections::BTreeMap<String, Value>>> {
        None
    }
    fn exec(&self, _sql: &str, _args: &[Value]) -> u64 {
        0
    }
    fn redis_cmd(&self, _key: u64, _name: &str, _args: &[Value]) -> Option<Value> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_storage_lock_is_a_failure_sentinel() {
        let s = NullStorage;
        assert_eq!(s.lock(1), LOCK_FAILED);
        assert_eq!(s.unlock(1, 0), UNLOCK_NO_HANDLE);
    }

    #[test]
    fn null_storage_init_and_dispose_lock_report_false() {
        let s = NullStorage;
        assert!(!s.init_lock(55));
        assert!(!s.dispose_lock(55));
    }
}
