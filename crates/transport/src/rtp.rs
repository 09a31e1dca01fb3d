//! Minimal RTP/UDP media transport
//!
//! The engine enforces the configured wire format regardless of what the
//! peer negotiated, so this stays a thin header codec: 12-byte fixed header,
//! payload-type mapping for the supported wire encodings, sequence and
//! timestamp bookkeeping. The remote address latches from the first packet
//! received.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;

use phone_agent_core::{AudioEncoding, AudioFormat};

use crate::TransportError;

const RTP_VERSION: u8 = 2;
const HEADER_LEN: usize = 12;

/// Static payload types for the wire encodings (RFC 3551); PCM16 rides a
/// dynamic payload type.
pub fn payload_type_for(format: AudioFormat) -> u8 {
    match format.encoding {
        AudioEncoding::Mulaw => 0,
        AudioEncoding::Alaw => 8,
        AudioEncoding::Pcm16le => 118,
    }
}

/// One bidirectional RTP session bound to a local UDP port.
pub struct RtpSession {
    socket: Arc<UdpSocket>,
    peer: Mutex<Option<SocketAddr>>,
    ssrc: u32,
    sequence: AtomicU16,
    timestamp: AtomicU32,
    payload_type: u8,
    samples_per_frame: u32,
}

impl RtpSession {
    /// Bind within `[port_min, port_max]`, trying ports in order.
    pub async fn bind(
        host: &str,
        port_min: u16,
        port_max: u16,
        wire: AudioFormat,
    ) -> Result<Self, TransportError> {
        let mut last_error = None;
        for port in port_min..=port_max {
            match UdpSocket::bind((host, port)).await {
                Ok(socket) => {
                    tracing::debug!(port, "rtp session bound");
                    return Ok(Self {
                        socket: Arc::new(socket),
                        peer: Mutex::new(None),
                        ssrc: rand::random(),
                        sequence: AtomicU16::new(rand::random()),
                        timestamp: AtomicU32::new(rand::random()),
                        payload_type: payload_type_for(wire),
                        samples_per_frame: wire.samples_per_frame() as u32,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(TransportError::Io(last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "no free rtp port")
        })))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Explicitly set the remote endpoint (outbound legs know it up front).
    pub fn set_peer(&self, addr: SocketAddr) {
        *self.peer.lock() = Some(addr);
    }

    /// Receive one packet and strip the RTP framing. Latches the peer
    /// address from the first packet.
    pub async fn recv(&self) -> Result<Bytes, TransportError> {
        let mut buffer = vec![0u8; 2048];
        loop {
            let (len, from) = self.socket.recv_from(&mut buffer).await?;
            if self.peer.lock().is_none() {
                *self.peer.lock() = Some(from);
                tracing::debug!(peer = %from, "rtp peer latched");
            }
            match strip_header(&buffer[..len]) {
                Ok(payload) => return Ok(Bytes::copy_from_slice(payload)),
                Err(e) => {
                    tracing::debug!("dropping malformed rtp packet: {e}");
                }
            }
        }
    }

    /// Send one wire-format frame with RTP framing.
    pub async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let peer = (*self.peer.lock()).ok_or(TransportError::Closed)?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp = self
            .timestamp
            .fetch_add(self.samples_per_frame, Ordering::Relaxed);

        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.push(RTP_VERSION << 6);
        packet.push(self.payload_type & 0x7f);
        packet.extend_from_slice(&sequence.to_be_bytes());
        packet.extend_from_slice(&timestamp.to_be_bytes());
        packet.extend_from_slice(&self.ssrc.to_be_bytes());
        packet.extend_from_slice(payload);

        self.socket.send_to(&packet, peer).await?;
        Ok(())
    }
}

/// Validate the fixed header and return the payload slice, honoring CSRC
/// count and the padding bit.
fn strip_header(packet: &[u8]) -> Result<&[u8], TransportError> {
    if packet.len() < HEADER_LEN {
        return Err(TransportError::Protocol("rtp packet shorter than header".into()));
    }
    let version = packet[0] >> 6;
    if version != RTP_VERSION {
        return Err(TransportError::Protocol(format!("rtp version {version}")));
    }
    let csrc_count = (packet[0] & 0x0f) as usize;
    let padding = packet[0] & 0x20 != 0;
    let start = HEADER_LEN + csrc_count * 4;
    if packet.len() < start {
        return Err(TransportError::Protocol("rtp csrc overruns packet".into()));
    }
    let mut end = packet.len();
    if padding {
        let pad = *packet.last().unwrap() as usize;
        if pad == 0 || start + pad > end {
            return Err(TransportError::Protocol("rtp bad padding".into()));
        }
        end -= pad;
    }
    Ok(&packet[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_between_two_sessions() {
        let wire = AudioFormat::mulaw_8k();
        let a = RtpSession::bind("127.0.0.1", 15000, 15100, wire).await.unwrap();
        let b = RtpSession::bind("127.0.0.1", 15101, 15200, wire).await.unwrap();
        a.set_peer(b.local_addr().unwrap());
        b.set_peer(a.local_addr().unwrap());

        let frame = vec![0x55u8; 160];
        a.send(&frame).await.unwrap();
        let received = b.recv().await.unwrap();
        assert_eq!(&received[..], &frame[..]);
    }

    #[test]
    fn header_stripping_handles_csrc_and_padding() {
        // Header with 1 CSRC and padding of 2.
        let mut packet = vec![0u8; 12];
        packet[0] = (RTP_VERSION << 6) | 0x20 | 0x01;
        packet.extend_from_slice(&[0, 0, 0, 0]); // csrc
        packet.extend_from_slice(&[9, 9, 9]); // payload
        packet.extend_from_slice(&[0, 2]); // padding (last byte = count)
        let payload = strip_header(&packet).unwrap();
        assert_eq!(payload, &[9, 9, 9]);
    }

    #[test]
    fn malformed_packets_are_rejected() {
        assert!(strip_header(&[0u8; 4]).is_err());
        let mut wrong_version = vec![0u8; 20];
        wrong_version[0] = 1 << 6;
        assert!(strip_header(&wrong_version).is_err());
    }

    #[test]
    fn payload_types_match_rfc3551() {
        assert_eq!(payload_type_for(AudioFormat::mulaw_8k()), 0);
        assert_eq!(payload_type_for(AudioFormat::new(AudioEncoding::Alaw, 8000)), 8);
    }
}
