//! Modular pipeline session
//!
//! Composes separate STT, LLM and TTS adapters behind the same
//! [`AgentSession`] contract the monolithic providers implement, so the
//! engine drives both identically. The worker owns the turn:
//!
//! 1. accumulate VAD-delimited caller audio into an utterance
//! 2. transcribe it and append the user turn to the chat history
//! 3. run the LLM, executing requested tool calls through the engine
//!    (bounded depth) before accepting final text
//! 4. synthesize the reply and stream it out as agent audio

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use phone_agent_audio::{pcm16_from_bytes, EnergyVad, VadAggressiveness, VadConfig};
use phone_agent_config::ProviderConfig;
use phone_agent_core::{
    AgentEvent, AgentSession, AppliedSettings, AudioFormat, ChatMessage, GatePolicy,
    GenerateRequest, LanguageModel, ProviderCapabilities, ProviderError, SpeechToText,
    TextToSpeech,
};

use crate::registry::{ProviderFactory, SessionParams};

/// Turn-taking knobs for pipeline sessions
#[derive(Debug, Clone)]
pub struct PipelineTuning {
    /// Trailing silence that ends an utterance
    pub end_of_utterance_ms: u32,
    /// Shorter utterances are discarded as noise
    pub min_utterance_ms: u32,
    /// Hard flush bound for callers who never pause
    pub max_utterance_ms: u32,
    /// Tool-call loop bound per turn
    pub max_tool_depth: u32,
    /// Function responses later than this proceed as errors
    pub function_response_timeout_ms: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            end_of_utterance_ms: 700,
            min_utterance_ms: 300,
            max_utterance_ms: 15_000,
            max_tool_depth: 5,
            function_response_timeout_ms: 10_000,
            max_tokens: 256,
            temperature: 0.7,
        }
    }
}

/// Factory composing the three adapters into sessions
pub struct PipelineFactory {
    name: String,
    config: ProviderConfig,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    tuning: PipelineTuning,
}

impl PipelineFactory {
    pub fn new(
        name: String,
        config: ProviderConfig,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Self {
        Self {
            name,
            config,
            stt,
            llm,
            tts,
            tuning: PipelineTuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: PipelineTuning) -> Self {
        self.tuning = tuning;
        self
    }
}

#[async_trait]
impl ProviderFactory for PipelineFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        let supported_input: Vec<AudioFormat> = if self.config.supported_input.is_empty() {
            vec![AudioFormat::pcm16(16000), AudioFormat::pcm16(8000)]
        } else {
            self.config.supported_input.iter().map(|f| (*f).into()).collect()
        };
        let supported_output: Vec<AudioFormat> = if self.config.supported_output.is_empty() {
            vec![AudioFormat::pcm16(24000), AudioFormat::pcm16(16000)]
        } else {
            self.config.supported_output.iter().map(|f| (*f).into()).collect()
        };
        ProviderCapabilities {
            name: self.name.clone(),
            supported_input,
            supported_output,
            // Pipelines have no server-side turn detection to trust.
            gate_policy: GatePolicy::LocalGate,
        }
    }

    fn pipeline_components(&self) -> Vec<String> {
        vec![
            format!("stt:{}", self.name),
            format!("llm:{}", self.name),
            format!("tts:{}", self.name),
        ]
    }

    async fn start(
        &self,
        params: SessionParams,
    ) -> Result<(Arc<dyn AgentSession>, mpsc::Receiver<AgentEvent>), ProviderError> {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(512);
        let pending: PendingResponses = Arc::new(Mutex::new(HashMap::new()));

        let worker = PipelineWorker {
            call_id: params.call_id.clone(),
            input_format: params.input_format,
            stt: self.stt.clone(),
            llm: self.llm.clone(),
            tts: self.tts.clone(),
            voice: self.config.voice.clone().unwrap_or_else(|| "default".into()),
            tuning: self.tuning.clone(),
            tools: params.tools.clone(),
            history: vec![ChatMessage::system(params.instructions.clone())],
            events: event_tx,
            commands: command_rx,
            pending: pending.clone(),
        };
        tokio::spawn(worker.run());

        let session = Arc::new(PipelineSession {
            commands: command_tx,
            pending,
            applied: AppliedSettings {
                input: params.input_format,
                output: params.output_format,
            },
            closed: AtomicBool::new(false),
        });

        if let Some(greeting) = &params.greeting {
            session.request_greeting(greeting).await?;
        }

        Ok((session, event_rx))
    }
}

type PendingResponses = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;

enum Command {
    Audio(Bytes),
    Greeting(String),
    Close,
}

struct PipelineSession {
    commands: mpsc::Sender<Command>,
    pending: PendingResponses,
    applied: AppliedSettings,
    closed: AtomicBool,
}

#[async_trait]
impl AgentSession for PipelineSession {
    async fn send_audio(&self, frame: Bytes) -> Result<(), ProviderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProviderError::Closed);
        }
        // Drop-on-full: while a turn is being processed the gate is closed
        // anyway, and late audio is worthless for the previous utterance.
        match self.commands.try_send(Command::Audio(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ProviderError::Closed),
        }
    }

    async fn send_function_response(
        &self,
        call_id: &str,
        result: Value,
    ) -> Result<(), ProviderError> {
        let sender = self.pending.lock().remove(call_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
                Ok(())
            }
            None => Err(ProviderError::Protocol(format!(
                "no pending function call '{call_id}'"
            ))),
        }
    }

    async fn request_greeting(&self, text: &str) -> Result<(), ProviderError> {
        self.commands
            .send(Command::Greeting(text.to_string()))
            .await
            .map_err(|_| ProviderError::Closed)
    }

    fn gate_policy(&self) -> GatePolicy {
        GatePolicy::LocalGate
    }

    fn applied_settings(&self) -> AppliedSettings {
        self.applied
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(Command::Close).await;
    }
}

struct PipelineWorker {
    call_id: String,
    input_format: AudioFormat,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    voice: String,
    tuning: PipelineTuning,
    tools: Vec<Value>,
    history: Vec<ChatMessage>,
    events: mpsc::Sender<AgentEvent>,
    commands: mpsc::Receiver<Command>,
    pending: PendingResponses,
}

impl PipelineWorker {
    async fn run(mut self) {
        let mut vad = EnergyVad::new(VadConfig {
            aggressiveness: VadAggressiveness::Level1,
            sample_rate_hz: self.input_format.sample_rate_hz,
        });
        let mut utterance: Vec<u8> = Vec::new();
        let mut speech_seen_ms: u32 = 0;
        let mut silence_ms: u32 = 0;
        let mut announced_speech = false;

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Close => break,
                Command::Greeting(text) => {
                    let _ = self
                        .events
                        .send(AgentEvent::AgentTranscript { text: text.clone() })
                        .await;
                    if self.speak(&text).await.is_err() {
                        break;
                    }
                    self.history.push(ChatMessage::assistant(text));
                    let _ = self.events.send(AgentEvent::TurnComplete).await;
                }
                Command::Audio(frame) => {
                    let Ok(samples) = pcm16_from_bytes(&frame) else {
                        tracing::debug!(call_id = %self.call_id, "dropping odd-sized audio frame");
                        continue;
                    };
                    let chunk_ms =
                        (samples.len() as u32 * 1000) / self.input_format.sample_rate_hz.max(1);
                    let update = vad.push(&samples);
                    utterance.extend_from_slice(&frame);

                    if update.is_speech {
                        speech_seen_ms += chunk_ms;
                        silence_ms = 0;
                        if !announced_speech {
                            announced_speech = true;
                            let _ = self.events.send(AgentEvent::UserStartedSpeaking).await;
                        }
                    } else if announced_speech {
                        silence_ms += chunk_ms;
                    } else {
                        // Leading silence; keep a short pre-roll, drop the rest.
                        let preroll_bytes =
                            (self.input_format.bytes_per_ms() * 500).min(utterance.len());
                        let start = utterance.len() - preroll_bytes;
                        utterance.drain(..start);
                    }

                    let utterance_ms =
                        (utterance.len() / self.input_format.bytes_per_ms().max(1)) as u32;
                    let complete = announced_speech
                        && (silence_ms >= self.tuning.end_of_utterance_ms
                            || utterance_ms >= self.tuning.max_utterance_ms);

                    if complete {
                        if speech_seen_ms >= self.tuning.min_utterance_ms {
                            let audio = std::mem::take(&mut utterance);
                            if self.turn(&audio).await.is_err() {
                                break;
                            }
                        } else {
                            tracing::debug!(
                                call_id = %self.call_id,
                                speech_ms = speech_seen_ms,
                                "discarding sub-minimum utterance"
                            );
                            utterance.clear();
                        }
                        vad.reset();
                        speech_seen_ms = 0;
                        silence_ms = 0;
                        announced_speech = false;
                    }
                }
            }
        }

        let _ = self.events.send(AgentEvent::Closed).await;
    }

    /// One full user turn: STT -> LLM (+tools) -> TTS.
    async fn turn(&mut self, audio: &[u8]) -> Result<(), ()> {
        let transcript = match self.stt.transcribe(audio, self.input_format, &[]).await {
            Ok(transcript) => transcript,
            Err(e) => {
                tracing::warn!(call_id = %self.call_id, "stt failed: {e}");
                return Ok(()); // drop the turn, stay alive
            }
        };
        if transcript.text.trim().is_empty() {
            return Ok(());
        }

        self.events
            .send(AgentEvent::UserTranscript {
                text: transcript.text.clone(),
                is_final: true,
            })
            .await
            .map_err(|_| ())?;
        self.history.push(ChatMessage::user(transcript.text));

        let reply = self.generate_with_tools().await;
        match reply {
            Ok(text) if !text.is_empty() => {
                self.events
                    .send(AgentEvent::AgentTranscript { text: text.clone() })
                    .await
                    .map_err(|_| ())?;
                self.speak(&text).await?;
                self.history.push(ChatMessage::assistant(text));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(call_id = %self.call_id, "llm failed: {e}");
                self.events
                    .send(AgentEvent::Error(e.to_string()))
                    .await
                    .map_err(|_| ())?;
            }
        }
        self.events
            .send(AgentEvent::TurnComplete)
            .await
            .map_err(|_| ())
    }

    /// LLM loop: execute requested tool calls (bounded depth) before
    /// accepting final text. A tools-unsupported rejection retries once
    /// without schemas and the turn proceeds tool-less.
    async fn generate_with_tools(&mut self) -> Result<String, ProviderError> {
        let mut tools = self.tools.clone();
        for _depth in 0..=self.tuning.max_tool_depth {
            let mut request = GenerateRequest::new(self.history.clone());
            request.tools = tools.clone();
            request.max_tokens = self.tuning.max_tokens;
            request.temperature = self.tuning.temperature;

            let response = match self.llm.generate(request).await {
                Ok(response) => response,
                Err(ProviderError::ToolsUnsupported(reason)) if !tools.is_empty() => {
                    tracing::warn!(
                        call_id = %self.call_id,
                        "llm rejected tool schemas ({reason}); retrying turn without tools"
                    );
                    tools.clear();
                    continue;
                }
                Err(e) => return Err(e),
            };

            if response.tool_calls.is_empty() {
                return Ok(response.text);
            }

            let mut assistant = ChatMessage::assistant(response.text.clone());
            assistant.tool_calls = response.tool_calls.clone();
            self.history.push(assistant);

            for call in response.tool_calls {
                let result = self.execute_function_call(&call.id, &call.name, call.arguments).await;
                self.history.push(ChatMessage::tool(call.id, result.to_string()));
            }
        }

        tracing::warn!(call_id = %self.call_id, "tool loop hit depth bound, asking for plain reply");
        let mut request = GenerateRequest::new(self.history.clone());
        request.max_tokens = self.tuning.max_tokens;
        request.temperature = self.tuning.temperature;
        self.llm.generate(request).await.map(|r| r.text)
    }

    /// Surface one function call to the engine and wait (bounded) for it.
    async fn execute_function_call(&self, id: &str, name: &str, arguments: Value) -> Value {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.to_string(), tx);

        let request = AgentEvent::FunctionCallRequest(phone_agent_core::ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        });
        if self.events.send(request).await.is_err() {
            return json!({"error": "session closed"});
        }

        let deadline = Duration::from_millis(self.tuning.function_response_timeout_ms);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => json!({"error": "tool execution dropped"}),
            Err(_) => {
                self.pending.lock().remove(id);
                tracing::warn!(call_id = %self.call_id, tool = %name, "function response deadline passed");
                json!({"error": format!("tool '{name}' timed out")})
            }
        }
    }

    /// Synthesize text and stream it out as agent audio.
    async fn speak(&self, text: &str) -> Result<(), ()> {
        match self.tts.synthesize(text, &self.voice).await {
            Ok(mut audio) => {
                while let Some(chunk) = audio.recv().await {
                    self.events
                        .send(AgentEvent::AgentAudio(chunk))
                        .await
                        .map_err(|_| ())?;
                }
                self.events
                    .send(AgentEvent::AgentAudioDone)
                    .await
                    .map_err(|_| ())
            }
            Err(e) => {
                tracing::error!(call_id = %self.call_id, "tts failed: {e}");
                self.events
                    .send(AgentEvent::Error(e.to_string()))
                    .await
                    .map_err(|_| ())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phone_agent_core::{GenerateResponse, Transcript};
    use phone_agent_config::ProviderKind;

    struct FakeStt;
    #[async_trait]
    impl SpeechToText for FakeStt {
        async fn transcribe(
            &self,
            _audio: &[u8],
            _format: AudioFormat,
            _hints: &[String],
        ) -> Result<Transcript, ProviderError> {
            Ok(Transcript {
                text: "what are your hours".into(),
                is_final: true,
            })
        }
    }

    /// First call requests a tool; after the tool result, returns text.
    struct FakeLlm {
        fail_tools_once: bool,
        calls: Mutex<u32>,
    }
    #[async_trait]
    impl LanguageModel for FakeLlm {
        async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
            let call_index = {
                let mut calls = self.calls.lock();
                *calls += 1;
                *calls
            };
            if self.fail_tools_once && call_index == 1 && !request.tools.is_empty() {
                return Err(ProviderError::ToolsUnsupported("no tool_use".into()));
            }
            let saw_tool_result = request
                .messages
                .iter()
                .any(|m| m.role == phone_agent_core::ChatRole::Tool);
            if !request.tools.is_empty() && !saw_tool_result {
                return Ok(GenerateResponse {
                    text: String::new(),
                    tool_calls: vec![phone_agent_core::ToolCallRequest {
                        id: "call_1".into(),
                        name: "lookup_hours".into(),
                        arguments: json!({}),
                    }],
                });
            }
            Ok(GenerateResponse {
                text: "We are open nine to five.".into(),
                tool_calls: vec![],
            })
        }
    }

    struct FakeTts;
    #[async_trait]
    impl TextToSpeech for FakeTts {
        async fn synthesize(
            &self,
            _text: &str,
            _voice: &str,
        ) -> Result<mpsc::Receiver<Bytes>, ProviderError> {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx.send(Bytes::from(vec![0u8; 960])).await;
                let _ = tx.send(Bytes::from(vec![0u8; 480])).await;
            });
            Ok(rx)
        }
    }

    fn factory(fail_tools_once: bool) -> PipelineFactory {
        let config = ProviderConfig {
            kind: ProviderKind::Pipeline,
            gate_policy: GatePolicy::LocalGate,
            url: None,
            api_key_env: None,
            model: None,
            voice: Some("test".into()),
            handshake_timeout_s: 5,
            keepalive_interval_s: 20,
            supported_input: vec![],
            supported_output: vec![],
            stt: None,
            llm: None,
            tts: None,
        };
        PipelineFactory::new(
            "test_pipeline".into(),
            config,
            Arc::new(FakeStt),
            Arc::new(FakeLlm {
                fail_tools_once,
                calls: Mutex::new(0),
            }),
            Arc::new(FakeTts),
        )
        .with_tuning(PipelineTuning {
            end_of_utterance_ms: 100,
            min_utterance_ms: 50,
            ..PipelineTuning::default()
        })
    }

    fn params() -> SessionParams {
        SessionParams {
            call_id: "c1".into(),
            input_format: AudioFormat::pcm16(16000),
            output_format: AudioFormat::pcm16(24000),
            instructions: "be brief".into(),
            tools: vec![json!({"type": "function", "function": {"name": "lookup_hours"}})],
            greeting: None,
        }
    }

    fn speech_frame(ms: u32) -> Bytes {
        let samples: Vec<i16> = (0..(16000 * ms / 1000))
            .map(|n| {
                let t = n as f32 / 16000.0;
                ((t * 300.0 * 2.0 * std::f32::consts::PI).sin() * 6000.0) as i16
            })
            .collect();
        Bytes::from(phone_agent_audio::pcm16_to_bytes(&samples))
    }

    fn silence_frame(ms: u32) -> Bytes {
        Bytes::from(vec![0u8; (16000 * ms / 1000) as usize * 2])
    }

    async fn drive_turn(fail_tools_once: bool) -> Vec<AgentEvent> {
        let (session, mut events) = factory(fail_tools_once).start(params()).await.unwrap();

        // 400 ms speech, then enough silence to end the utterance.
        for _ in 0..20 {
            session.send_audio(speech_frame(20)).await.unwrap();
        }
        for _ in 0..10 {
            session.send_audio(silence_frame(20)).await.unwrap();
        }

        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("pipeline stalled")
                .expect("events closed early");
            match &event {
                AgentEvent::FunctionCallRequest(call) => {
                    let id = call.id.clone();
                    seen.push(event);
                    session
                        .send_function_response(&id, json!({"hours": "9-5"}))
                        .await
                        .unwrap();
                }
                AgentEvent::TurnComplete => {
                    seen.push(event);
                    break;
                }
                _ => seen.push(event),
            }
        }
        session.close().await;
        seen
    }

    #[tokio::test]
    async fn full_turn_runs_stt_llm_tool_tts() {
        let events = drive_turn(false).await;
        assert!(events.iter().any(|e| matches!(e, AgentEvent::UserStartedSpeaking)));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::UserTranscript { text, .. } if text.contains("hours"))));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::FunctionCallRequest(_))));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::AgentAudio(_))));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::AgentAudioDone)));
    }

    #[tokio::test]
    async fn tools_unsupported_retries_once_without_schemas() {
        let events = drive_turn(true).await;
        // Tool-less retry: no function call surfaced, but audio still spoken.
        assert!(!events.iter().any(|e| matches!(e, AgentEvent::FunctionCallRequest(_))));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::AgentAudioDone)));
    }
}
