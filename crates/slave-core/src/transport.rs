//! The `Transport` seam: outbound delivery to the controller (TCP) and to the
//! adapter (unix datagram), plus the inbound reader tasks that feed the shared
//! message queue.
//!
//! Bridge calls execute on a pool slot's plain OS thread, not inside the async
//! runtime, so the seam they see is a synchronous `send`. The actual socket
//! I/O happens on owned async tasks; `send` only needs to hand bytes to an
//! unbounded channel, which is a non-blocking, synchronous operation.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixDatagram};
use tokio::sync::mpsc;

use crate::framer::{self, frame_datagram};
use crate::types::TransportError;

/// Where an outbound frame should go.
#[derive(Debug, Clone)]
pub enum Dest {
    Controller,
    Adapter(String),
}

/// The synchronous seam bridge calls use to emit outbound frames.
pub trait Transport: Send + Sync {
    fn send(&self, dest: Dest, bytes: Vec<u8>) -> Result<(), TransportError>;
}

/// A `Transport` backed by channels to the owned socket tasks.
pub struct ChannelTransport {
    tcp_tx: mpsc::UnboundedSender<Vec<u8>>,
    datagram_tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
}

impl ChannelTransport {
    pub fn new(
        tcp_tx: mpsc::UnboundedSender<Vec<u8>>,
        datagram_tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
    ) -> Self {
        Self { tcp_tx, datagram_tx }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, dest: Dest, bytes: Vec<u8>) -> Result<(), TransportError> {
        match dest {
            Dest::Controller => self.tcp_tx.send(bytes).map_err(|_| TransportError::Closed),
            Dest::Adapter(addr) => self
                .datagram_tx
                .send((addr, bytes))
                .map_err(|_| TransportError::Closed),
        }
    }
}

/// Persistent TCP connection to the controller. Owns the read half (pushing
/// decoded frames to `inbound`) and the write half (draining `outbound_rx`).
pub struct TcpControlClient;

impl TcpControlClient {
    pub async fn connect(
        addr: &str,
    ) -> Result<
        (
            mpsc::UnboundedSender<Vec<u8>>,
            mpsc::UnboundedReceiver<Vec<u8>>,
            TcpStream,
        ),
        TransportError,
    > {
        let stream = TcpStream::connect(addr).await.map_err(TransportError::Send)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((tx, rx, stream))
    }

    /// Drives the connection until it closes: reads frames into `inbound`,
    /// writes frames handed to `outbound_rx`. Runs on its own task.
    pub async fn run(
        stream: TcpStream,
        inbound: mpsc::UnboundedSender<Vec<u8>>,
        mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let reader_task = async move {
            loop {
                match framer::read_frame(&mut reader).await {
                    Ok(bytes) => {
                        if inbound.send(bytes).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        };

        let writer_task = async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if framer::write_frame(&mut write_half, &bytes).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        };

        tokio::join!(reader_task, writer_task);
    }
}

/// Unix datagram socket shared with the local adapter.
pub struct UnixDatagramSocket;

impl UnixDatagramSocket {
    pub fn bind(path: &str) -> Result<UnixDatagram, TransportError> {
        let _ = std::fs::remove_file(path);
        UnixDatagram::bind(path).map_err(TransportError::Send)
    }

    /// Drives the socket until told to stop: reads datagrams into `inbound`,
    /// sends datagrams handed to `outbound_rx`.
    pub async fn run(
        socket: Arc<UnixDatagram>,
        inbound: mpsc::UnboundedSender<(Vec<u8>, String)>,
        mut outbound_rx: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    ) {
        let read_socket = Arc::clone(&socket);
        let reader_task = async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match read_socket.recv_from(&mut buf).await {
                    Ok((n, addr)) => {
                        let addr_str = addr
                            .as_pathname()
                            .map(|p| p.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        if let Ok(payload) = framer::unframe_datagram(&buf[..n]) {
                            if inbound.send((payload.to_vec(), addr_str)).is_err() {
                                break;
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
        };

        let writer_task = async move {
            while let Some((addr, bytes)) = outbound_rx.recv().await {
                let framed = frame_datagram(&bytes);
                let _ = socket.send_to(&framed, &addr).await;
            }
        };

        tokio::join!(reader_task, writer_task);
    }
}

/// Reply-routing helper shared by the dispatcher: picks the transport
/// destination that mirrors where a [`Message`] came from.
pub fn reply_dest(source_id: u64, source_addr: &str) -> Dest {
    if source_id != 0 {
        Dest::Controller
    } else {
        Dest::Adapter(source_addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_dest_prefers_tcp_when_source_id_nonzero() {
        assert!(matches!(reply_dest(7, ""), Dest::Controller));
    }

    #[test]
    fn reply_dest_uses_datagram_when_source_id_zero() {
        match reply_dest(0, "/tmp/adapter.sock") {
            Dest::Adapter(addr) => assert_eq!(addr, "/tmp/adapter.sock"),
            _ => panic!("expected Adapter dest"),
        }
    }
}
