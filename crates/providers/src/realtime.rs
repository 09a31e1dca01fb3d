//! Monolithic realtime agent session
//!
//! One WebSocket session per call against a realtime speech provider:
//! JSON text events both directions, audio as base64 payloads. The engine
//! only depends on the event contract here, not on any one vendor.
//!
//! Protocol notes learned the hard way, encoded as behavior:
//! - The handshake ack (`session.updated`) must arrive before any audio is
//!   streamed; a silent provider fails the call at the handshake timeout.
//! - `response.audio.delta` arrives as a plain base64 string on some
//!   providers and as a nested object on others; both shapes are accepted
//!   on one stream.
//! - Under server VAD the input buffer is never explicitly committed;
//!   commit frames on an empty buffer fault the session.
//! - Idle sessions disconnect without transport pings; a keep-alive task
//!   runs for the session's lifetime.

use async_trait::async_trait;
use base64::Engine as _;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use phone_agent_config::ProviderConfig;
use phone_agent_core::{
    AgentEvent, AgentSession, AppliedSettings, AudioEncoding, AudioFormat, GatePolicy,
    ProviderCapabilities, ProviderError, ToolCallRequest,
};

use crate::registry::{ProviderFactory, SessionParams};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const B64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD;

/// Wire name for an audio format in session settings
fn format_name(format: AudioFormat) -> &'static str {
    match format.encoding {
        AudioEncoding::Mulaw => "g711_ulaw",
        AudioEncoding::Alaw => "g711_alaw",
        AudioEncoding::Pcm16le => "pcm16",
    }
}

/// Parse an acknowledged format name; PCM rates are not carried in the
/// name, so the requested rate is assumed for matching names.
fn parse_format(name: &str, requested: AudioFormat) -> AudioFormat {
    match name {
        "g711_ulaw" => AudioFormat::mulaw_8k(),
        "g711_alaw" => AudioFormat::new(AudioEncoding::Alaw, 8000),
        "pcm16" if requested.encoding == AudioEncoding::Pcm16le => requested,
        "pcm16" => AudioFormat::pcm16(24000),
        other => {
            tracing::warn!("provider acknowledged unknown format '{other}', assuming requested");
            requested
        }
    }
}

/// Factory for monolithic realtime sessions
pub struct RealtimeFactory {
    name: String,
    config: ProviderConfig,
}

impl RealtimeFactory {
    pub fn new(name: String, config: ProviderConfig) -> Self {
        Self { name, config }
    }
}

#[async_trait]
impl ProviderFactory for RealtimeFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        let default_inputs = vec![
            AudioFormat::pcm16(24000),
            AudioFormat::pcm16(16000),
            AudioFormat::mulaw_8k(),
            AudioFormat::new(AudioEncoding::Alaw, 8000),
        ];
        let supported_input: Vec<AudioFormat> = if self.config.supported_input.is_empty() {
            default_inputs.clone()
        } else {
            self.config.supported_input.iter().map(|f| (*f).into()).collect()
        };
        let supported_output: Vec<AudioFormat> = if self.config.supported_output.is_empty() {
            default_inputs
        } else {
            self.config.supported_output.iter().map(|f| (*f).into()).collect()
        };
        ProviderCapabilities {
            name: self.name.clone(),
            supported_input,
            supported_output,
            gate_policy: self.config.gate_policy,
        }
    }

    fn pipeline_components(&self) -> Vec<String> {
        vec![format!("realtime:{}", self.name)]
    }

    async fn start(
        &self,
        params: SessionParams,
    ) -> Result<(Arc<dyn AgentSession>, mpsc::Receiver<AgentEvent>), ProviderError> {
        let url = self
            .config
            .url
            .clone()
            .ok_or_else(|| ProviderError::HandshakeFailed("no url configured".into()))?;

        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|e| ProviderError::HandshakeFailed(e.to_string()))?;
        if let Some(env_var) = &self.config.api_key_env {
            let key = std::env::var(env_var).map_err(|_| {
                ProviderError::HandshakeFailed(format!("credential {env_var} not set"))
            })?;
            request.headers_mut().insert(
                "Authorization",
                format!("Bearer {key}")
                    .parse()
                    .map_err(|_| ProviderError::HandshakeFailed("bad api key".into()))?,
            );
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let (mut sink, source) = stream.split();

        let settings = json!({
            "type": "session.update",
            "session": {
                "instructions": params.instructions,
                "voice": self.config.voice.clone().unwrap_or_else(|| "alloy".into()),
                "model": self.config.model,
                "input_audio_format": format_name(params.input_format),
                "output_audio_format": format_name(params.output_format),
                "turn_detection": { "type": "server_vad" },
                "tools": params.tools,
            }
        });
        sink.send(Message::Text(settings.to_string()))
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let (ack_tx, ack_rx) = oneshot::channel();
        spawn_reader(
            source,
            event_tx,
            ack_tx,
            params.input_format,
            params.output_format,
            params.call_id.clone(),
        );

        let handshake_timeout = Duration::from_secs(self.config.handshake_timeout_s as u64);
        let applied = match tokio::time::timeout(handshake_timeout, ack_rx).await {
            Ok(Ok(applied)) => applied,
            Ok(Err(_)) => {
                return Err(ProviderError::HandshakeFailed(
                    "session closed before settings ack".into(),
                ))
            }
            Err(_) => {
                return Err(ProviderError::HandshakeFailed(format!(
                    "no settings ack within {handshake_timeout:?}"
                )))
            }
        };

        tracing::info!(
            provider = %self.name,
            call_id = %params.call_id,
            input = %applied.input,
            output = %applied.output,
            "realtime session established"
        );

        let session = Arc::new(RealtimeSession {
            sink: Mutex::new(sink),
            applied,
            gate_policy: self.config.gate_policy,
            closed: AtomicBool::new(false),
        });

        spawn_keepalive(
            Arc::downgrade(&session),
            Duration::from_secs(self.config.keepalive_interval_s as u64),
        );

        if let Some(greeting) = &params.greeting {
            session.request_greeting(greeting).await?;
        }

        Ok((session, event_rx))
    }
}

fn spawn_reader(
    mut source: WsSource,
    events: mpsc::Sender<AgentEvent>,
    ack: oneshot::Sender<AppliedSettings>,
    requested_input: AudioFormat,
    requested_output: AudioFormat,
    call_id: String,
) {
    tokio::spawn(async move {
        let mut ack = Some(ack);
        while let Some(message) = source.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                _ => continue,
            };
            let value: Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!(call_id = %call_id, "unparsed provider event: {e}");
                    continue;
                }
            };

            let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
            let event = match event_type {
                // session.created arrives on connect, before our settings
                // are applied; only session.updated acknowledges them.
                "session.created" => continue,
                "session.updated" => {
                    if let Some(ack_tx) = ack.take() {
                        let session = value.get("session").cloned().unwrap_or(Value::Null);
                        let input = session
                            .get("input_audio_format")
                            .and_then(|f| f.as_str())
                            .map(|name| parse_format(name, requested_input))
                            .unwrap_or(requested_input);
                        let output = session
                            .get("output_audio_format")
                            .and_then(|f| f.as_str())
                            .map(|name| parse_format(name, requested_output))
                            .unwrap_or(requested_output);
                        let _ = ack_tx.send(AppliedSettings { input, output });
                    }
                    continue;
                }
                "input_audio_buffer.speech_started" => AgentEvent::UserStartedSpeaking,
                "conversation.item.input_audio_transcription.completed" => {
                    let text = value
                        .get("transcript")
                        .and_then(|t| t.as_str())
                        .unwrap_or("")
                        .to_string();
                    AgentEvent::UserTranscript { text, is_final: true }
                }
                "response.audio_transcript.done" => {
                    let text = value
                        .get("transcript")
                        .and_then(|t| t.as_str())
                        .unwrap_or("")
                        .to_string();
                    AgentEvent::AgentTranscript { text }
                }
                "response.audio.delta" => match decode_audio_delta(&value) {
                    Some(audio) => AgentEvent::AgentAudio(audio.into()),
                    None => {
                        tracing::debug!(call_id = %call_id, "audio delta with no payload");
                        continue;
                    }
                },
                "response.audio.done" => AgentEvent::AgentAudioDone,
                "response.function_call_arguments.done" => {
                    let id = value
                        .get("call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let name = value
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let arguments = value
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .and_then(|raw| serde_json::from_str(raw).ok())
                        .unwrap_or(Value::Null);
                    AgentEvent::FunctionCallRequest(ToolCallRequest { id, name, arguments })
                }
                "response.done" => AgentEvent::TurnComplete,
                "error" => {
                    let message = value
                        .pointer("/error/message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown provider error")
                        .to_string();
                    AgentEvent::Error(message)
                }
                _ => continue,
            };

            if events.send(event).await.is_err() {
                break;
            }
        }
        let _ = events.send(AgentEvent::Closed).await;
    });
}

fn spawn_keepalive(session: std::sync::Weak<RealtimeSession>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick is immediate
        loop {
            ticker.tick().await;
            let Some(session) = session.upgrade() else { return };
            if session.closed.load(Ordering::SeqCst) {
                return;
            }
            let mut sink = session.sink.lock().await;
            if sink.send(Message::Ping(Vec::new())).await.is_err() {
                return;
            }
        }
    });
}

/// The audio-delta payload is a plain base64 string on some providers and
/// a nested object on others; accept both for one stream.
fn decode_audio_delta(value: &Value) -> Option<Vec<u8>> {
    let encoded = match value.get("delta") {
        Some(Value::String(s)) => Some(s.as_str()),
        Some(Value::Object(map)) => map
            .get("audio")
            .or_else(|| map.get("data"))
            .and_then(|a| a.as_str()),
        _ => None,
    }?;
    B64.decode(encoded).ok()
}

struct RealtimeSession {
    sink: Mutex<WsSink>,
    applied: AppliedSettings,
    gate_policy: GatePolicy,
    closed: AtomicBool,
}

impl RealtimeSession {
    async fn send_json(&self, value: Value) -> Result<(), ProviderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProviderError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(value.to_string()))
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))
    }
}

#[async_trait]
impl AgentSession for RealtimeSession {
    async fn send_audio(&self, frame: bytes::Bytes) -> Result<(), ProviderError> {
        // Server VAD segments the buffer itself; appending is all we do.
        self.send_json(json!({
            "type": "input_audio_buffer.append",
            "audio": B64.encode(&frame),
        }))
        .await
    }

    async fn send_function_response(
        &self,
        call_id: &str,
        result: Value,
    ) -> Result<(), ProviderError> {
        self.send_json(json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call_id,
                "output": result.to_string(),
            }
        }))
        .await?;
        // Nudge the model to continue the turn with the result in hand.
        self.send_json(json!({ "type": "response.create" })).await
    }

    async fn request_greeting(&self, text: &str) -> Result<(), ProviderError> {
        self.send_json(json!({
            "type": "response.create",
            "response": {
                "instructions": format!("Greet the caller by saying exactly: {text}"),
            }
        }))
        .await
    }

    fn gate_policy(&self) -> GatePolicy {
        self.gate_policy
    }

    fn applied_settings(&self) -> AppliedSettings {
        self.applied
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_delta_accepts_plain_string() {
        let encoded = B64.encode([1u8, 2, 3]);
        let value = json!({"type": "response.audio.delta", "delta": encoded});
        assert_eq!(decode_audio_delta(&value).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn audio_delta_accepts_nested_object() {
        let encoded = B64.encode([4u8, 5]);
        let value = json!({"type": "response.audio.delta", "delta": {"audio": encoded}});
        assert_eq!(decode_audio_delta(&value).unwrap(), vec![4, 5]);
        let value = json!({"delta": {"data": B64.encode([9u8])}});
        assert_eq!(decode_audio_delta(&value).unwrap(), vec![9]);
    }

    #[test]
    fn audio_delta_rejects_garbage() {
        assert!(decode_audio_delta(&json!({"delta": 42})).is_none());
        assert!(decode_audio_delta(&json!({"delta": "not base64!!!"})).is_none());
    }

    #[test]
    fn format_names_round_trip() {
        let mulaw = AudioFormat::mulaw_8k();
        assert_eq!(parse_format(format_name(mulaw), mulaw), mulaw);
        let pcm = AudioFormat::pcm16(16000);
        assert_eq!(parse_format("pcm16", pcm), pcm);
        // Unknown names fall back to the requested format.
        assert_eq!(parse_format("opus", pcm), pcm);
    }
}
