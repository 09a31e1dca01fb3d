//! Media channel plumbing
//!
//! The PBX delivers call audio over AudioSocket (TCP, UUID-correlated) or
//! RTP. [`MediaHub`] owns the AudioSocket accept loop and matches incoming
//! connections to waiting calls by UUID; a call that sets up first parks a
//! waiter, a connection that lands first is stashed briefly.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use phone_agent_core::AudioFormat;
use phone_agent_transport::{
    AudioSocketMessage, AudioSocketServer, MediaReader, MediaWriter, RtpSession, TransportError,
};

/// How long an early AudioSocket connection waits for its call.
const STASH_TTL: Duration = Duration::from_secs(10);

type Connection = (MediaReader, MediaWriter);

/// Accepts AudioSocket connections and hands them to their calls.
pub struct MediaHub {
    waiters: Arc<DashMap<Uuid, oneshot::Sender<Connection>>>,
    stashed: Arc<DashMap<Uuid, Connection>>,
}

impl MediaHub {
    /// Bind the listener and start the accept loop.
    pub async fn start(bind_addr: &str) -> Result<Arc<Self>, TransportError> {
        let server = AudioSocketServer::bind(bind_addr).await?;
        let hub = Arc::new(Self {
            waiters: Arc::new(DashMap::new()),
            stashed: Arc::new(DashMap::new()),
        });

        let accept_hub = hub.clone();
        tokio::spawn(async move {
            loop {
                match server.accept().await {
                    Ok((id, reader, writer)) => accept_hub.deliver(id, (reader, writer)),
                    Err(e) => {
                        tracing::warn!("audiosocket accept failed: {e}");
                    }
                }
            }
        });

        Ok(hub)
    }

    fn deliver(&self, id: Uuid, connection: Connection) {
        if let Some((_, waiter)) = self.waiters.remove(&id) {
            if waiter.send(connection).is_err() {
                tracing::debug!(session = %id, "media waiter gone before delivery");
            }
            return;
        }
        // Connection beat the call setup; park it briefly.
        self.stashed.insert(id, connection);
        let stashed = self.stashed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STASH_TTL).await;
            if stashed.remove(&id).is_some() {
                tracing::warn!(session = %id, "unclaimed audiosocket connection dropped");
            }
        });
    }

    /// Wait for the media connection correlated with `id`.
    pub async fn wait_for(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> Result<Connection, TransportError> {
        if let Some((_, connection)) = self.stashed.remove(&id) {
            return Ok(connection);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(connection)) => Ok(connection),
            _ => {
                self.waiters.remove(&id);
                Err(TransportError::Protocol(format!(
                    "no media connection for {id} within {timeout:?}"
                )))
            }
        }
    }
}

/// One call's media stream, over either transport.
pub enum MediaStream {
    Socket {
        reader: MediaReader,
        writer: MediaWriter,
    },
    Rtp(Arc<RtpSession>),
}

impl MediaStream {
    /// Split into an ingress reader task feed and an egress writer.
    /// The reader task pushes raw wire chunks (and a final `None` on
    /// hangup) into the returned channel.
    pub fn split(self) -> (mpsc::Receiver<Bytes>, MediaSink) {
        let (tx, rx) = mpsc::channel(256);
        match self {
            MediaStream::Socket { mut reader, writer } => {
                tokio::spawn(async move {
                    loop {
                        match reader.read_message().await {
                            Ok(AudioSocketMessage::Audio(frame)) => {
                                if tx.send(frame).await.is_err() {
                                    return;
                                }
                            }
                            Ok(AudioSocketMessage::Dtmf(digit)) => {
                                tracing::debug!(digit = %digit, "dtmf on media stream");
                            }
                            Ok(AudioSocketMessage::Terminate) | Ok(AudioSocketMessage::Error(_)) => {
                                return; // closing tx signals hangup
                            }
                            Ok(AudioSocketMessage::Uuid(_)) => {}
                            Err(e) => {
                                tracing::debug!("media read failed: {e}");
                                return;
                            }
                        }
                    }
                });
                (rx, MediaSink::Socket(writer))
            }
            MediaStream::Rtp(session) => {
                let recv_session = session.clone();
                tokio::spawn(async move {
                    loop {
                        match recv_session.recv().await {
                            Ok(payload) => {
                                if tx.send(payload).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::debug!("rtp recv failed: {e}");
                                return;
                            }
                        }
                    }
                });
                (rx, MediaSink::Rtp(session))
            }
        }
    }
}

/// Egress half of a media stream.
pub enum MediaSink {
    Socket(MediaWriter),
    Rtp(Arc<RtpSession>),
}

impl MediaSink {
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        match self {
            MediaSink::Socket(writer) => writer.send_audio(frame).await,
            MediaSink::Rtp(session) => session.send(frame).await,
        }
    }

    /// Ask the PBX side to hang up (AudioSocket only; RTP legs are hung up
    /// via ARI).
    pub async fn hangup(&mut self) {
        if let MediaSink::Socket(writer) = self {
            let _ = writer.send_hangup().await;
        }
    }
}

/// Bind an RTP session for one call from the configured port range.
pub async fn bind_rtp(
    host: &str,
    port_min: u16,
    port_max: u16,
    wire: AudioFormat,
) -> Result<Arc<RtpSession>, TransportError> {
    Ok(Arc::new(RtpSession::bind(host, port_min, port_max, wire).await?))
}
