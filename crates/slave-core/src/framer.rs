//! Length-prefixed framing shared by the TCP control client and the datagram
//! transport: every envelope on the wire is a 4-byte big-endian length
//! followed by that many bytes of codec output.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::TransportError;

/// Frames larger than this are rejected; a sane worker never emits one, so a
/// huge value here almost certainly means a desynced stream.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    w.write_all(&len.to_be_bytes()).await.map_err(TransportError::Send)?;
    w.write_all(payload).await.map_err(TransportError::Send)?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.map_err(|_| TransportError::Closed)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await.map_err(|_| TransportError::Closed)?;
    Ok(buf)
}

/// Frame a payload for the datagram transport, where there is no persistent
/// stream to read_exact against: the whole frame is one datagram.
pub fn frame_datagram(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Parse a single datagram framed by [`frame_datagram`].
pub fn unframe_datagram(datagram: &[u8]) -> Result<&[u8], TransportError> {
    if datagram.len() < 4 {
        return Err(TransportError::Closed);
    }
    let len = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]) as usize;
    let rest = &datagram[4..];
    if len != rest.len() {
        return Err(TransportError::FrameTooLarge(len));
    }
    Ok(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let mut buf: Vec<u8> = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let got = read_frame(&mut cursor).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn datagram_frame_round_trips() {
        let framed = frame_datagram(b"payload");
        let back = unframe_datagram(&framed).unwrap();
        assert_eq!(back, b"payload");
    }

    #[test]
    fn datagram_frame_rejects_length_mismatch() {
        let mut framed = frame_datagram(b"payload");
        framed[3] = 0xff;
        assert!(unframe_datagram(&framed).is_err());
    }
}
