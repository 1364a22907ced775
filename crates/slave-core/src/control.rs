//! Control loop (C6): the worker's one connection to the controller (TCP) and
//! one datagram socket shared with the local adapter.
//!
//! Grounded on `main.go`'s `sayHello`/`reportState` pair and its 1-second
//! status print / 10-second report goroutines: on connect we announce
//! ourselves with a `SlaveHello` carrying our pid, our unix socket path, and
//! our free-slot count, then every 10 seconds repeat just the free-slot count
//! as a `SlaveChange`. Every inbound frame, from either socket, is decoded and
//! handed to the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::codec::{Codec, JsonCodec};
use crate::dispatcher;
use crate::pool::InterpreterPool;
use crate::storage::Storage;
use crate::transport::{Dest, Transport, TcpControlClient, UnixDatagramSocket};
use crate::types::{Message, MessageType, Scheme, SlaveSettings, StartupError, Tag, Value};

const REPORT_INTERVAL: Duration = Duration::from_secs(10);
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the control loop needs to run: the resolved settings, the
/// shared pool/storage/transport, and the outbound-frame receivers that drain
/// whatever the bridge's `ChannelTransport` side hands off.
pub struct ControlLoop {
    pub settings: SlaveSettings,
    pub pool: &'static InterpreterPool,
    pub storage: Arc<dyn Storage>,
    pub transport: Arc<dyn Transport>,
    pub unix_socket_path: String,
}

impl ControlLoop {
    /// Connect to the controller, bind the adapter datagram socket, announce
    /// ourselves, and run until the process is asked to shut down.
    pub async fn run(
        self,
        tcp_outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        datagram_outbound_rx: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), StartupError> {
        let socket = UnixDatagramSocket::bind(&self.unix_socket_path).map_err(|e| StartupError::BindUnixSocket {
            path: self.unix_socket_path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;
        let socket = Arc::new(socket);
        let (dg_inbound_tx, mut dg_inbound_rx) = mpsc::unbounded_channel::<(Vec<u8>, String)>();
        tokio::spawn(UnixDatagramSocket::run(Arc::clone(&socket), dg_inbound_tx, datagram_outbound_rx));

        let (tcp_inbound_tx, mut tcp_inbound_rx, stream) =
            TcpControlClient::connect(&self.settings.controller_addr)
                .await
                .map_err(|e| StartupError::ConnectController {
                    addr: self.settings.controller_addr.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                })?;
        tokio::spawn(TcpControlClient::run(stream, tcp_inbound_tx, tcp_outbound_rx));

        self.say_hello();

        let mut report_ticker = tokio::time::interval(REPORT_INTERVAL);
        let mut status_ticker = tokio::time::interval(STATUS_INTERVAL);

        loop {
            tokio::select! {
                Some(bytes) = tcp_inbound_rx.recv() => {
                    self.handle_inbound(&bytes);
                }
                Some((bytes, _addr)) = dg_inbound_rx.recv() => {
                    self.handle_inbound(&bytes);
                }
                _ = report_ticker.tick() => {
                    self.report_state();
                }
                _ = status_ticker.tick() => {
                    let (unlockflow, locklogic, unlocklogic) = crate::metrics::snapshot();
                    tracing::debug!(
                        idle = self.pool.idle_count(),
                        total = self.pool.size(),
                        unlockflow,
                        locklogic,
                        unlocklogic,
                        "pool status"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Decodes on the calling (async) task, then hands the blocking VM
    /// checkout/dispatch off to a blocking-pool thread so a slow script hook
    /// never stalls the control loop's own tokio worker thread.
    fn handle_inbound(&self, bytes: &[u8]) {
        let codec = JsonCodec;
        let msg = match codec.decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode inbound frame");
                return;
            }
        };

        let pool = self.pool;
        let storage = Arc::clone(&self.storage);
        let transport = Arc::clone(&self.transport);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = dispatcher::on_deliver(&msg, pool, storage.as_ref(), transport.as_ref()) {
                tracing::warn!(error = %e, "failed to dispatch inbound envelope");
            }
        });
    }

    fn say_hello(&self) {
        let mut body = std::collections::BTreeMap::new();
        body.insert(crate::types::keys::ID, Value::Int(std::process::id() as i64));
        if !self.settings.tcp_only {
            body.insert(crate::types::keys::UNIX_ADDR, Value::Str(self.unix_socket_path.clone()));
        }
        body.insert(crate::types::keys::VALUE, Value::Int(self.pool.idle_count() as i64));

        let msg = Message::new(MessageType::SlaveHello)
            .with_tag(Tag::Master)
            .with_scheme(Scheme::S2S)
            .with_body(body);
        self.send_to_controller(&msg);
    }

    fn report_state(&self) {
        let mut body = std::collections::BTreeMap::new();
        body.insert(crate::types::keys::VALUE, Value::Int(self.pool.idle_count() as i64));

        let msg = Message::new(MessageType::SlaveChange)
            .with_tag(Tag::Master)
            .with_scheme(Scheme::S2S)
            .with_body(body);
        self.send_to_controller(&msg);
    }

    fn send_to_controller(&self, msg: &Message) {
        let codec = JsonCodec;
        match codec.encode(msg) {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(Dest::Controller, bytes) {
                    tracing::warn!(error = %e, "failed to send to controller");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode outbound envelope"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_interval_is_ten_seconds() {
        assert_eq!(REPORT_INTERVAL, Duration::from_secs(10));
    }
}
