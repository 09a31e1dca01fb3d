//! Provider traits and event types
//!
//! A provider is either a monolithic agent (one bidirectional session that
//! does STT+LLM+TTS internally) or a modular pipeline of separate STT, LLM
//! and TTS adapters. Both variants are driven through [`AgentSession`] so the
//! engine never branches on which kind it is talking to.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::audio::AudioFormat;
use crate::llm::{GenerateRequest, GenerateResponse, ToolCallRequest};

/// How inbound audio gating is decided for a provider.
///
/// Server-gating providers run their own turn detection; applying local
/// barge-in cancellation on top of it makes the agent interrupt itself when
/// its own TTS leaks into the inbound path. The two policies are kept as an
/// explicit enum rather than a boolean flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GatePolicy {
    /// The engine's gating manager controls flow and barge-in locally
    #[default]
    LocalGate,
    /// Trust the provider's server-side turn detection; no local barge-in
    ServerGate,
}

/// Formats a provider declares it can accept and emit
#[derive(Debug, Clone)]
pub struct ProviderCapabilities {
    pub name: String,
    pub supported_input: Vec<AudioFormat>,
    pub supported_output: Vec<AudioFormat>,
    pub gate_policy: GatePolicy,
}

impl ProviderCapabilities {
    pub fn supports_input(&self, format: AudioFormat) -> bool {
        self.supported_input.contains(&format)
    }

    pub fn supports_output(&self, format: AudioFormat) -> bool {
        self.supported_output.contains(&format)
    }
}

/// What the provider acknowledged it will actually accept and emit.
/// Compared against the transport plan after the handshake; a mismatch is
/// logged and the provider's values win.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedSettings {
    pub input: AudioFormat,
    pub output: AudioFormat,
}

/// Final or partial transcript from an STT adapter
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
}

/// Events emitted by a provider session, monolithic or pipelined
#[derive(Debug, Clone)]
pub enum AgentEvent {
    UserStartedSpeaking,
    UserTranscript { text: String, is_final: bool },
    /// Final text of what the agent is saying this turn
    AgentTranscript { text: String },
    /// Provider-output-format audio for the playback manager
    AgentAudio(Bytes),
    /// The current agent utterance is complete
    AgentAudioDone,
    FunctionCallRequest(ToolCallRequest),
    TurnComplete,
    Error(String),
    Closed,
}

/// Errors surfaced by provider sessions and adapters
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("provider protocol error: {0}")]
    Protocol(String),

    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("provider request failed: {0}")]
    Request(String),

    /// The LLM rejected the request because of the attached tool schemas.
    /// The pipeline retries once without tools on this condition.
    #[error("tool calling unsupported by provider: {0}")]
    ToolsUnsupported(String),

    #[error("provider session closed")]
    Closed,
}

/// A live provider session for one call.
///
/// Events flow out through the `mpsc::Receiver<AgentEvent>` handed back by
/// the session factory; commands flow in through these methods.
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Push one provider-input-format audio frame
    async fn send_audio(&self, frame: Bytes) -> Result<(), ProviderError>;

    /// Return a function-call result to the provider. Must be called within
    /// the provider's deadline (10 s) of the corresponding request event.
    async fn send_function_response(
        &self,
        call_id: &str,
        result: Value,
    ) -> Result<(), ProviderError>;

    /// Ask the provider to speak the given greeting text
    async fn request_greeting(&self, text: &str) -> Result<(), ProviderError>;

    /// Gating policy for this provider
    fn gate_policy(&self) -> GatePolicy;

    /// Formats the provider acknowledged during the handshake
    fn applied_settings(&self) -> AppliedSettings;

    /// Close the session. Idempotent.
    async fn close(&self);
}

/// Speech-to-text over one utterance of audio
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(
        &self,
        audio: &[u8],
        format: AudioFormat,
        hints: &[String],
    ) -> Result<Transcript, ProviderError>;
}

/// Text generation with optional tool calls
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ProviderError>;
}

/// Text-to-speech producing a stream of provider-output-format chunks
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
    ) -> Result<mpsc::Receiver<Bytes>, ProviderError>;
}
