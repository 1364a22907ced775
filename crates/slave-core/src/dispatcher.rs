//! Dispatcher (C5): turns an inbound `Deliver` envelope into a VM pool
//! invocation and, on failure, emits the `FlowReturn` acknowledgement the
//! adapter/controller is waiting on.
//!
//! Grounded directly on `OnDeliver` in the original dispatch table: unwrap the
//! envelope body into an inner envelope, branch on `ClientEnter`/
//! `ClientLeave`/anything else, bracket the dispatch with the lock
//! init/dispose pair and the `CurrentSessionId` set/clear (the set/clear half
//! lives in `pool.rs`'s slot loop since it must run on the VM's own thread).

use std::time::Duration;

use crate::codec::{decode_inner, Codec, JsonCodec};
use crate::pool::{Invocation, InterpreterPool, Origin};
use crate::storage::Storage;
use crate::transport::{reply_dest, Dest, Transport};
use crate::types::{keys, Message, MessageType, ProtocolError, Scheme, Tag};

/// How long a dispatch waits for a free pool slot before giving up. Matches
/// the storage call timeout (§7): a VM pool under sustained overload should
/// fail a single dispatch rather than back up the control loop indefinitely.
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Extract and decode the inner `Message` carried in a `Deliver` envelope's
/// body, without touching the VM pool, storage, or transport. Fails with
/// `DataDamaged` if the body is missing (§4.1) or `DataNotMatch` if the inner
/// envelope can't be decoded. Split out of `on_deliver` so the guard is
/// independently testable without standing up a VM pool.
pub fn decode_deliver_body(msg: &Message) -> Result<Message, ProtocolError> {
    let body = msg.body.as_ref().ok_or(ProtocolError::DataDamaged)?;
    decode_inner(&JsonCodec, body)
}

/// Handle one inbound `Deliver` envelope.
pub fn on_deliver(
    msg: &Message,
    pool: &InterpreterPool,
    storage: &dyn Storage,
    transport: &dyn Transport,
) -> Result<(), ProtocolError> {
    let real_msg = decode_deliver_body(msg)?;

    let Some(session_id) = real_msg.session_id.first().copied() else {
        return Err(ProtocolError::DataDamaged);
    };

    let origin = if !msg.session_id.is_empty() {
        Origin { source_id: msg.session_id[0], source_addr: String::new() }
    } else {
        Origin { source_id: 0, source_addr: msg.unix_addr.clone().unwrap_or_default() }
    };

    let msg_type = real_msg.msg_type.and_then(MessageType::from_i64);
    let host = real_msg
        .body
        .as_ref()
        .and_then(|b| b.get(&keys::HOST))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned();

    let dispatched = match msg_type {
        Some(MessageType::ClientEnter) => {
            storage.init_lock(session_id);
            pool.dispatch(Invocation::Enter { session_id, host, origin }, CHECKOUT_TIMEOUT)
        }
        Some(MessageType::ClientLeave) => {
            storage.dispose_lock(session_id);
            pool.dispatch(Invocation::Leave { session_id, host, origin }, CHECKOUT_TIMEOUT)
        }
        _ => {
            let inner_body = real_msg.body.clone().unwrap_or_default();
            pool.dispatch(Invocation::Message { session_id, body: inner_body, origin }, CHECKOUT_TIMEOUT)
        }
    };

    if !dispatched {
        tracing::warn!(session_id, "pool checkout timed out; envelope dropped");
    }

    if msg.error_code != 0 {
        send_flow_return(msg, &real_msg, transport);
    }

    Ok(())
}

/// Acknowledge a failed envelope by echoing the *inner* session ids back as a
/// `FlowReturn`, routed to wherever the outer envelope came from. Per §8 S2,
/// the ack's `SessionId` is the inner message's session-id list, and when
/// routed over TCP its `Serial` carries the outer envelope's source id.
fn send_flow_return(outer: &Message, inner: &Message, transport: &dyn Transport) {
    if inner.session_id.is_empty() {
        return;
    }
    let mut ack = Message::new(MessageType::FlowReturn)
        .with_tag(Tag::Adapter)
        .with_scheme(Scheme::S2S)
        .with_session_id(inner.session_id.clone());

    let dest = if !outer.session_id.is_empty() {
        ack = ack.with_serial(outer.session_id[0]);
        Dest::Controller
    } else {
        crate::metrics::incr_unlockflow();
        reply_dest(0, outer.unix_addr.as_deref().unwrap_or_default())
    };

    let codec = JsonCodec;
    if let Ok(bytes) = codec.encode(&ack) {
        let _ = transport.send(dest, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NullStorage;
    use crate::transport::ChannelTransport;
    use std::collections::BTreeMap;

    fn encode_inner(msg: &Message) -> BTreeMap<i64, crate::types::Value> {
        crate::codec::message_to_body(msg)
    }

    #[test]
    fn decode_deliver_body_rejects_missing_body() {
        let msg = Message::new(MessageType::Deliver);
        assert_eq!(decode_deliver_body(&msg), Err(ProtocolError::DataDamaged));
    }

    #[test]
    fn decode_deliver_body_decodes_a_well_formed_inner_envelope() {
        let inner = Message::new(MessageType::ClientEnter).with_session_id(vec![55]);
        let msg = Message::new(MessageType::Deliver).with_body(encode_inner(&inner));
        let decoded = decode_deliver_body(&msg).unwrap();
        assert_eq!(decoded.msg_type, Some(MessageType::ClientEnter as i64));
        assert_eq!(decoded.session_id, vec![55]);
    }

    /// §4.1/§7: a bodiless `Deliver` fails before any VM checkout or
    /// transport send is attempted. Uses a real, zero-slot pool (never
    /// dereferenced on this path) and a real `NullStorage` so `on_deliver`
    /// itself — not just its extracted guard — is exercised end to end.
    #[test]
    fn on_deliver_rejects_missing_body_and_sends_no_frames() {
        let msg = Message::new(MessageType::Deliver).with_session_id(vec![1001]);
        let pool = InterpreterPool::empty_for_test();
        let storage = NullStorage;
        let (tcp_tx, mut tcp_rx) = tokio::sync::mpsc::unbounded_channel();
        let (dg_tx, mut dg_rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = ChannelTransport::new(tcp_tx, dg_tx);

        let result = on_deliver(&msg, &pool, &storage, &transport);

        assert_eq!(result, Err(ProtocolError::DataDamaged));
        assert!(tcp_rx.try_recv().is_err());
        assert!(dg_rx.try_recv().is_err());
    }

    #[test]
    fn send_flow_return_is_a_noop_without_inner_session_ids() {
        let outer = Message::new(MessageType::Deliver).with_session_id(vec![1001]);
        let inner = Message::new(MessageType::Deliver);
        let (tcp_tx, mut tcp_rx) = tokio::sync::mpsc::unbounded_channel();
        let (dg_tx, _dg_rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = ChannelTransport::new(tcp_tx, dg_tx);
        send_flow_return(&outer, &inner, &transport);
        assert!(tcp_rx.try_recv().is_err());
    }

    /// §8 S2: outer `SessionId:[1001]`, inner `SessionId:[7]` → the emitted
    /// `FlowReturn` carries the inner session id and the outer source id as
    /// `Serial`, sent over TCP since the outer envelope had a session-id list.
    #[test]
    fn flow_return_carries_inner_session_id_and_outer_serial() {
        let outer = Message::new(MessageType::Deliver).with_session_id(vec![1001]);
        let inner = Message::new(MessageType::Deliver).with_session_id(vec![7]);
        let (tcp_tx, mut tcp_rx) = tokio::sync::mpsc::unbounded_channel();
        let (dg_tx, _dg_rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = ChannelTransport::new(tcp_tx, dg_tx);

        send_flow_return(&outer, &inner, &transport);

        let bytes = tcp_rx.try_recv().expect("expected one FlowReturn on the TCP channel");
        let ack = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(ack.msg_type, Some(MessageType::FlowReturn as i64));
        assert_eq!(ack.session_id, vec![7]);
        assert_eq!(ack.serial, Some(1001));
        assert!(tcp_rx.try_recv().is_err(), "exactly one FlowReturn must be emitted");
    }

    /// §8 S3-style routing: a datagram-originated outer envelope (empty
    /// session-id list) routes its `FlowReturn` to the adapter datagram
    /// channel instead of TCP.
    #[test]
    fn flow_return_routes_to_datagram_when_outer_has_no_session_id() {
        let mut outer = Message::new(MessageType::Deliver);
        outer.unix_addr = Some("/tmp/adapter.sock".to_string());
        let inner = Message::new(MessageType::Deliver).with_session_id(vec![55]);
        let (tcp_tx, mut tcp_rx) = tokio::sync::mpsc::unbounded_channel();
        let (dg_tx, mut dg_rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = ChannelTransport::new(tcp_tx, dg_tx);

        send_flow_return(&outer, &inner, &transport);

        assert!(tcp_rx.try_recv().is_err());
        let (addr, bytes) = dg_rx.try_recv().expect("expected one FlowReturn on the datagram channel");
        assert_eq!(addr, "/tmp/adapter.sock");
        let ack = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(ack.session_id, vec![55]);
        assert_eq!(ack.serial, None);
    }

    #[test]
    fn inner_envelope_round_trips_through_encode_inner() {
        let inner = Message::new(MessageType::ClientEnter).with_session_id(vec![99]);
        let body = encode_inner(&inner);
        let codec = JsonCodec;
        let back = decode_inner(&codec, &body).unwrap();
        assert_eq!(back.msg_type, Some(MessageType::ClientEnter as i64));
        assert_eq!(back.session_id, vec![99]);
    }
}
