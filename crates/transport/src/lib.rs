//! PBX control plane and media transports
//!
//! - [`ari`]: HTTP + WebSocket client for the Asterisk REST Interface
//! - [`audiosocket`]: bidirectional TCP framed-audio transport
//! - [`rtp`]: minimal RTP/UDP media transport
//! - [`orchestrator`]: per-call transport planning (wire vs provider formats)
//! - [`playback`]: paced 20 ms egress with warm-up and low-watermark states

pub mod ari;
pub mod audiosocket;
pub mod orchestrator;
pub mod playback;
pub mod rtp;

pub use ari::{AriClient, AriEvent, Channel, OriginateParams, Playback as AriPlayback};
pub use audiosocket::{AudioSocketMessage, AudioSocketServer, MediaReader, MediaWriter};
pub use orchestrator::{AudioConverter, ConversionStep, TransportPlan};
pub use playback::{PlaybackEvent, PlaybackHandle, PlaybackManager, StopReason};
pub use rtp::RtpSession;

use phone_agent_audio::AudioError;

/// Transport-layer errors. Recoverable at the call boundary: the affected
/// call ends with outcome `error`, other calls continue.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    /// ARI request failed. `status` is the HTTP status code, or 0 when
    /// the request never produced a response (connect/send failure), so
    /// callers can classify 4xx-vs-5xx without parsing the message.
    #[error("ari request failed ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("audio profile incompatible with provider: {0}")]
    ProfileIncompatible(String),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("transport closed")]
    Closed,
}
