//! Conversation coordinator
//!
//! The single-threaded per-call turn loop. Everything that can happen to a
//! live call arrives on one bus (provider events, playback events,
//! barge-in triggers from the ingress task, cross-task commands), so
//! session mutations are totally ordered without locks beyond the handle's
//! mutex.
//!
//! Turn state machine: `Idle -> UserSpeaking -> ProviderThinking ->
//! ProviderSpeaking -> Idle`. Turn latency is measured from the last
//! forwarded user-audio frame to the first agent-audio chunk of the reply.

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use phone_agent_config::CallContextConfig;
use phone_agent_core::{
    AgentEvent, AgentSession, CallSession, InCallContext, ToolCallRequest, ToolInvocation,
    ToolPhase, TurnRole,
};
use phone_agent_tools::{ToolContext, ToolRegistry};
use phone_agent_transport::{
    PlaybackEvent, PlaybackHandle, PlaybackManager, StopReason, TransportPlan,
};

use crate::gating::GatingManager;
use crate::store::CallCommand;

/// Providers fault function calls not answered within this window.
const FUNCTION_CALL_DEADLINE: Duration = Duration::from_secs(10);

/// Everything that can happen to a live call, merged onto one bus.
#[derive(Debug)]
pub enum CallEvent {
    Agent(AgentEvent),
    Playback(PlaybackEvent),
    /// Ingress task detected barge-in (local-gate providers only)
    BargeIn,
    Command(CallCommand),
}

/// Turn state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    UserSpeaking,
    ProviderThinking,
    ProviderSpeaking,
}

/// How the coordinator loop ended; drives engine cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEnd {
    /// Agent-side hangup (farewell finished, or conversation over)
    Hangup,
    /// PBX side hung up first
    PbxHangup,
    /// Call was transferred away; bridge stays up
    Transferred,
    /// Provider session dropped mid-call
    ProviderClosed,
    /// Process shutdown drained the call
    Shutdown,
    Error(String),
}

/// Per-call coordinator.
pub struct Coordinator {
    pub call_id: String,
    pub provider_name: String,
    pub session: Arc<Mutex<CallSession>>,
    pub agent: Arc<dyn AgentSession>,
    pub plan: TransportPlan,
    pub playback: PlaybackManager,
    pub gating: Arc<GatingManager>,
    pub tools: Arc<ToolRegistry>,
    pub context: CallContextConfig,
    /// Wire frames toward the egress writer task
    pub egress: mpsc::Sender<Bytes>,
    pub bus: mpsc::Receiver<CallEvent>,
    pub bus_tx: mpsc::Sender<CallEvent>,
    /// Updated by the ingress task on every forwarded frame
    pub last_user_audio: Arc<Mutex<Instant>>,
}

struct ActivePlayback {
    handle: PlaybackHandle,
    input: Option<mpsc::Sender<Bytes>>,
}

impl Coordinator {
    pub async fn run(mut self) -> CallEnd {
        // Playback events funnel onto the bus through one forwarder.
        let (playback_events_tx, mut playback_events_rx) = mpsc::channel::<PlaybackEvent>(64);
        let bus_tx = self.bus_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = playback_events_rx.recv().await {
                if bus_tx.send(CallEvent::Playback(event)).await.is_err() {
                    return;
                }
            }
        });

        let mut state = TurnState::Idle;
        let mut active: Option<ActivePlayback> = None;
        // Latency samples start with the first user turn; the greeting has
        // no user audio to measure from.
        let mut turn_first_audio_pending = false;

        loop {
            let Some(event) = self.bus.recv().await else {
                return CallEnd::Error("call bus closed".into());
            };

            match event {
                CallEvent::Agent(AgentEvent::UserStartedSpeaking) => {
                    // Server-gating providers own barge-in: their speech
                    // detection during playback is the interruption signal.
                    if active.is_some()
                        && self.agent.gate_policy() == phone_agent_core::GatePolicy::ServerGate
                    {
                        self.session.lock().metrics.barge_in_count += 1;
                        metrics::counter!("barge_in_events_total").increment(1);
                        self.stop_playback(&mut active, StopReason::BargeIn).await;
                    }
                    state = TurnState::UserSpeaking;
                }

                CallEvent::Agent(AgentEvent::UserTranscript { text, is_final }) => {
                    if is_final && !text.is_empty() {
                        self.session.lock().push_turn(TurnRole::User, text);
                        state = TurnState::ProviderThinking;
                        turn_first_audio_pending = true;
                    }
                }

                CallEvent::Agent(AgentEvent::AgentTranscript { text }) => {
                    if !text.is_empty() {
                        self.session.lock().push_turn(TurnRole::Assistant, text);
                    }
                }

                CallEvent::Agent(AgentEvent::AgentAudio(chunk)) => {
                    if active.is_none() {
                        active = Some(self.start_playback(&playback_events_tx));
                        state = TurnState::ProviderSpeaking;
                        if turn_first_audio_pending {
                            turn_first_audio_pending = false;
                            self.record_turn_latency();
                        }
                    }
                    if let Some(playback) = &active {
                        if let Some(input) = &playback.input {
                            if input.send(chunk).await.is_err() {
                                tracing::debug!(call_id = %self.call_id, "playback input gone");
                            }
                        }
                    }
                }

                CallEvent::Agent(AgentEvent::AgentAudioDone) => {
                    // Closing the input lets the playback drain and finish.
                    if let Some(playback) = &mut active {
                        playback.input = None;
                    }
                }

                CallEvent::Agent(AgentEvent::FunctionCallRequest(call)) => {
                    self.handle_function_call(call).await;
                }

                CallEvent::Agent(AgentEvent::TurnComplete) => {
                    if state != TurnState::ProviderSpeaking {
                        state = TurnState::Idle;
                    }
                }

                CallEvent::Agent(AgentEvent::Error(message)) => {
                    tracing::warn!(call_id = %self.call_id, "provider error: {message}");
                }

                CallEvent::Agent(AgentEvent::Closed) => {
                    self.stop_playback(&mut active, StopReason::ProviderClosed).await;
                    return CallEnd::ProviderClosed;
                }

                CallEvent::Playback(PlaybackEvent::Started { .. }) => {}

                CallEvent::Playback(PlaybackEvent::Underflow { .. }) => {
                    self.session.lock().metrics.underflow_count += 1;
                }

                CallEvent::Playback(PlaybackEvent::Finished { playback_id, .. }) => {
                    let current = active
                        .as_ref()
                        .map(|p| p.handle.id == playback_id)
                        .unwrap_or(false);
                    if current {
                        active = None;
                        self.gating.on_playback_end();
                        self.session.lock().playback_ref = None;
                        state = TurnState::Idle;
                        // HangupReady: farewell audio has fully played out.
                        if self.session.lock().hangup_pending {
                            return CallEnd::Hangup;
                        }
                    }
                }

                CallEvent::BargeIn => {
                    {
                        let mut session = self.session.lock();
                        session.metrics.barge_in_count = self.gating.barge_in_count();
                    }
                    self.stop_playback(&mut active, StopReason::BargeIn).await;
                    state = TurnState::UserSpeaking;
                }

                CallEvent::Command(CallCommand::HangupAfterFarewell { farewell }) => {
                    self.session.lock().hangup_pending = true;
                    // The farewell lands in history via its agent
                    // transcript once the provider speaks it.
                    if let Err(e) = self.agent.request_greeting(&farewell).await {
                        tracing::warn!(call_id = %self.call_id, "farewell synthesis failed: {e}");
                        self.session.lock().push_turn(TurnRole::Assistant, farewell);
                        return CallEnd::Hangup;
                    }
                }

                CallEvent::Command(CallCommand::TransferComplete { channel_id }) => {
                    tracing::info!(
                        call_id = %self.call_id,
                        target = %channel_id,
                        "transfer target bridged, detaching"
                    );
                    self.stop_playback(&mut active, StopReason::Replaced).await;
                    return CallEnd::Transferred;
                }

                CallEvent::Command(CallCommand::TransferFailed { reason }) => {
                    tracing::warn!(call_id = %self.call_id, "transfer failed: {reason}");
                    self.session.lock().current_action = None;
                }

                CallEvent::Command(CallCommand::Digit(digit)) => {
                    tracing::debug!(call_id = %self.call_id, digit = %digit, "dtmf");
                }

                CallEvent::Command(CallCommand::Hangup) => {
                    self.stop_playback(&mut active, StopReason::Hangup).await;
                    return CallEnd::PbxHangup;
                }

                CallEvent::Command(CallCommand::Shutdown) => {
                    self.stop_playback(&mut active, StopReason::Hangup).await;
                    return CallEnd::Shutdown;
                }
            }
        }
    }

    fn start_playback(&self, events: &mpsc::Sender<PlaybackEvent>) -> ActivePlayback {
        let (input_tx, input_rx) = mpsc::channel(256);
        let handle = self.playback.start(
            &self.call_id,
            input_rx,
            self.plan.egress_converter(),
            self.plan.wire_frame_bytes(),
            self.plan.wire.bytes_per_ms(),
            self.egress.clone(),
            events.clone(),
        );
        self.gating.on_playback_start();
        self.session.lock().playback_ref = Some(handle.id.clone());
        ActivePlayback {
            handle,
            input: Some(input_tx),
        }
    }

    async fn stop_playback(&self, active: &mut Option<ActivePlayback>, reason: StopReason) {
        if let Some(playback) = active.take() {
            playback.handle.stop(reason).await;
            self.gating.on_playback_end();
            self.session.lock().playback_ref = None;
        }
    }

    fn record_turn_latency(&self) {
        let latency_ms = self.last_user_audio.lock().elapsed().as_millis() as u64;
        self.session.lock().metrics.record_turn_latency(latency_ms);
        metrics::histogram!("turn_latency_ms", "provider" => self.provider_name.clone())
            .record(latency_ms as f64);
    }

    /// Execute one in-call function call and answer the provider within
    /// its deadline.
    async fn handle_function_call(&self, call: ToolCallRequest) {
        let allowed = self.tools.collect_for_context(
            ToolPhase::InCall,
            &self.context.in_call_tools,
            self.context.disable_global_in_call,
        );

        let in_call = {
            let session = self.session.lock();
            InCallContext {
                identity: phone_agent_core::CallIdentity {
                    call_id: session.call_id.clone(),
                    direction: session.direction,
                    caller_number: session.caller_number.clone(),
                    called_number: session.called_number.clone(),
                    context_name: session.context_name.clone(),
                },
                pre_call_results: session.pre_call_results.clone(),
            }
        };
        let ctx = ToolContext::InCall(in_call);

        let started = Instant::now();
        let result = match allowed.iter().find(|t| t.name() == call.name) {
            Some(tool) => {
                let execution = phone_agent_tools::registry::execute_timed(
                    tool,
                    &ctx,
                    call.arguments.clone(),
                );
                match tokio::time::timeout(FUNCTION_CALL_DEADLINE - Duration::from_secs(1), execution)
                    .await
                {
                    Ok((Ok(output), _)) => output.result,
                    Ok((Err(e), _)) => json!({"error": e.to_string()}),
                    Err(_) => json!({"error": format!("tool '{}' exceeded the deadline", call.name)}),
                }
            }
            None => {
                tracing::warn!(call_id = %self.call_id, tool = %call.name, "model requested unknown tool");
                json!({"error": format!("unknown tool '{}'", call.name)})
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.session.lock().record_tool_call(ToolInvocation {
            name: call.name.clone(),
            params: call.arguments,
            result: result.clone(),
            timestamp: chrono::Utc::now(),
            duration_ms,
        });

        if let Err(e) = self.agent.send_function_response(&call.id, result).await {
            tracing::warn!(call_id = %self.call_id, "function response failed: {e}");
        }
    }
}
