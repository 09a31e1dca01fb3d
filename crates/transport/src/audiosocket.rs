//! AudioSocket media transport
//!
//! Asterisk's AudioSocket is a plain TCP stream of `type | length(BE u16) |
//! payload` frames. The first frame on every connection is a 16-byte UUID
//! that correlates the media stream with the channel that dialed us; audio
//! frames carry wire-format bytes both directions.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use crate::TransportError;

const TYPE_TERMINATE: u8 = 0x00;
const TYPE_UUID: u8 = 0x01;
const TYPE_DTMF: u8 = 0x03;
const TYPE_AUDIO: u8 = 0x10;
const TYPE_ERROR: u8 = 0xff;

/// One decoded AudioSocket frame
#[derive(Debug, Clone)]
pub enum AudioSocketMessage {
    Uuid(Uuid),
    Audio(Bytes),
    Dtmf(char),
    Terminate,
    Error(u8),
}

/// Listener for inbound media connections.
pub struct AudioSocketServer {
    listener: TcpListener,
}

impl AudioSocketServer {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "audiosocket listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and read its identifying UUID frame.
    /// Returns the session id plus split read/write halves.
    pub async fn accept(&self) -> Result<(Uuid, MediaReader, MediaWriter), TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = MediaReader { inner: read_half };

        match reader.read_message().await? {
            AudioSocketMessage::Uuid(id) => {
                tracing::debug!(session = %id, peer = %peer, "audiosocket session open");
                Ok((id, reader, MediaWriter { inner: write_half }))
            }
            other => Err(TransportError::Protocol(format!(
                "audiosocket expected uuid frame first, got {other:?}"
            ))),
        }
    }
}

/// Read half of an AudioSocket connection.
pub struct MediaReader {
    inner: OwnedReadHalf,
}

impl MediaReader {
    /// Read one frame. `Terminate` and EOF both end the stream.
    pub async fn read_message(&mut self) -> Result<AudioSocketMessage, TransportError> {
        let mut header = [0u8; 3];
        if let Err(e) = self.inner.read_exact(&mut header).await {
            return if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Ok(AudioSocketMessage::Terminate)
            } else {
                Err(e.into())
            };
        }
        let kind = header[0];
        let length = u16::from_be_bytes([header[1], header[2]]) as usize;
        let mut payload = vec![0u8; length];
        self.inner.read_exact(&mut payload).await?;

        match kind {
            TYPE_TERMINATE => Ok(AudioSocketMessage::Terminate),
            TYPE_UUID => {
                if payload.len() != 16 {
                    return Err(TransportError::Protocol(format!(
                        "uuid frame length {length}, expected 16"
                    )));
                }
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&payload);
                Ok(AudioSocketMessage::Uuid(Uuid::from_bytes(raw)))
            }
            TYPE_DTMF => Ok(AudioSocketMessage::Dtmf(
                payload.first().map(|&b| b as char).unwrap_or('\0'),
            )),
            TYPE_AUDIO => Ok(AudioSocketMessage::Audio(Bytes::from(payload))),
            TYPE_ERROR => Ok(AudioSocketMessage::Error(
                payload.first().copied().unwrap_or(0),
            )),
            other => Err(TransportError::Protocol(format!(
                "unknown audiosocket frame type {other:#04x}"
            ))),
        }
    }
}

/// Write half of an AudioSocket connection.
pub struct MediaWriter {
    inner: OwnedWriteHalf,
}

impl MediaWriter {
    /// Send one wire-format audio frame.
    pub async fn send_audio(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > u16::MAX as usize {
            return Err(TransportError::Protocol(format!(
                "audio frame too large: {}",
                frame.len()
            )));
        }
        let mut buffer = Vec::with_capacity(3 + frame.len());
        buffer.push(TYPE_AUDIO);
        buffer.extend_from_slice(&(frame.len() as u16).to_be_bytes());
        buffer.extend_from_slice(frame);
        self.inner.write_all(&buffer).await?;
        Ok(())
    }

    /// Ask the PBX to hang the channel up.
    pub async fn send_hangup(&mut self) -> Result<(), TransportError> {
        self.inner.write_all(&[TYPE_TERMINATE, 0, 0]).await?;
        Ok(())
    }
}

/// Encode a UUID frame, used by tests and the outbound media dialer.
pub fn encode_uuid_frame(id: Uuid) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(19);
    buffer.push(TYPE_UUID);
    buffer.extend_from_slice(&16u16.to_be_bytes());
    buffer.extend_from_slice(id.as_bytes());
    buffer
}

/// Connect to a remote AudioSocket endpoint and announce `id` (test harness
/// and loopback checks).
pub async fn connect(
    addr: &str,
    id: Uuid,
) -> Result<(MediaReader, MediaWriter), TransportError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut writer = MediaWriter { inner: write_half };
    writer.inner.write_all(&encode_uuid_frame(id)).await?;
    Ok((MediaReader { inner: read_half }, writer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uuid_handshake_and_audio_round_trip() {
        let server = AudioSocketServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let id = Uuid::new_v4();

        let client = tokio::spawn(async move {
            let (mut reader, mut writer) = connect(&addr, id).await.unwrap();
            writer.send_audio(&[0x7f; 160]).await.unwrap();
            match reader.read_message().await.unwrap() {
                AudioSocketMessage::Audio(frame) => assert_eq!(frame.len(), 160),
                other => panic!("expected audio, got {other:?}"),
            }
        });

        let (session_id, mut reader, mut writer) = server.accept().await.unwrap();
        assert_eq!(session_id, id);
        match reader.read_message().await.unwrap() {
            AudioSocketMessage::Audio(frame) => {
                assert_eq!(frame.len(), 160);
                writer.send_audio(&frame).await.unwrap();
            }
            other => panic!("expected audio, got {other:?}"),
        }
        client.await.unwrap();
    }

    #[tokio::test]
    async fn eof_reads_as_terminate() {
        let server = AudioSocketServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let id = Uuid::new_v4();

        let client = tokio::spawn(async move {
            let (_reader, _writer) = connect(&addr, id).await.unwrap();
            // dropped immediately: connection closes
        });

        let (_, mut reader, _writer) = server.accept().await.unwrap();
        client.await.unwrap();
        match reader.read_message().await.unwrap() {
            AudioSocketMessage::Terminate => {}
            other => panic!("expected terminate, got {other:?}"),
        }
    }
}
