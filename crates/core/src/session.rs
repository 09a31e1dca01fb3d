//! Per-call session state and the persisted call record
//!
//! A [`CallSession`] is created when the PBX answers (or an outbound
//! origination enters Stasis) and is mutated only by the engine task that
//! owns the call. On cleanup an immutable [`CallRecord`] snapshot is
//! persisted and the session is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::tool::ToolInvocation;

/// Direction of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    #[default]
    Inbound,
    Outbound,
}

impl std::fmt::Display for CallDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallDirection::Inbound => write!(f, "inbound"),
            CallDirection::Outbound => write!(f, "outbound"),
        }
    }
}

/// Terminal (or in-flight) state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    #[default]
    InProgress,
    Completed,
    Transferred,
    ConsentDenied,
    ConsentTimeout,
    VoicemailDropped,
    MachineDetected,
    Error,
    Abandoned,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::InProgress => "in_progress",
            CallOutcome::Completed => "completed",
            CallOutcome::Transferred => "transferred",
            CallOutcome::ConsentDenied => "consent_denied",
            CallOutcome::ConsentTimeout => "consent_timeout",
            CallOutcome::VoicemailDropped => "voicemail_dropped",
            CallOutcome::MachineDetected => "machine_detected",
            CallOutcome::Error => "error",
            CallOutcome::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(CallOutcome::InProgress),
            "completed" => Ok(CallOutcome::Completed),
            "transferred" => Ok(CallOutcome::Transferred),
            "consent_denied" => Ok(CallOutcome::ConsentDenied),
            "consent_timeout" => Ok(CallOutcome::ConsentTimeout),
            "voicemail_dropped" => Ok(CallOutcome::VoicemailDropped),
            "machine_detected" => Ok(CallOutcome::MachineDetected),
            "error" => Ok(CallOutcome::Error),
            "abandoned" => Ok(CallOutcome::Abandoned),
            other => Err(format!("unknown call outcome: {other}")),
        }
    }
}

/// Role of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

/// One entry in the conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnEntry {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// An in-flight call action (e.g. a transfer being executed)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentAction {
    pub action_type: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
}

/// Per-call quality metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallMetrics {
    pub total_turns: u32,
    pub avg_turn_latency_ms: f64,
    pub max_turn_latency_ms: u64,
    pub barge_in_count: u32,
    pub underflow_count: u32,
    pub snr_estimate_db: Option<f32>,
}

impl CallMetrics {
    /// Fold one turn latency sample into the rolling average and max
    pub fn record_turn_latency(&mut self, latency_ms: u64) {
        let n = self.total_turns as f64;
        self.avg_turn_latency_ms = (self.avg_turn_latency_ms * n + latency_ms as f64) / (n + 1.0);
        self.total_turns += 1;
        self.max_turn_latency_ms = self.max_turn_latency_ms.max(latency_ms);
    }
}

/// Per-call state, owned exclusively by the engine task driving the call
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub caller_number: String,
    pub called_number: String,
    pub context_name: String,
    pub direction: CallDirection,
    pub provider_name: String,
    pub started_at: DateTime<Utc>,
    pub conversation_history: Vec<TurnEntry>,
    pub pre_call_results: HashMap<String, String>,
    pub tool_calls: Vec<ToolInvocation>,
    pub playback_ref: Option<String>,
    pub audio_capture_enabled: bool,
    pub current_action: Option<CurrentAction>,
    pub metrics: CallMetrics,
    pub outcome: CallOutcome,
    /// Set by the hangup tool; the engine hangs up once farewell audio
    /// finishes playing
    pub hangup_pending: bool,
    pub transfer_destination: Option<String>,
    /// Compare-and-set guard: post-call tools dispatch at most once even
    /// when cleanup races (PBX hangup vs engine hangup vs provider close)
    post_call_fired: Arc<AtomicBool>,
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        caller_number: impl Into<String>,
        called_number: impl Into<String>,
        context_name: impl Into<String>,
        direction: CallDirection,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            caller_number: caller_number.into(),
            called_number: called_number.into(),
            context_name: context_name.into(),
            direction,
            provider_name: String::new(),
            started_at: Utc::now(),
            conversation_history: Vec::new(),
            pre_call_results: HashMap::new(),
            tool_calls: Vec::new(),
            playback_ref: None,
            audio_capture_enabled: true,
            current_action: None,
            metrics: CallMetrics::default(),
            outcome: CallOutcome::InProgress,
            hangup_pending: false,
            transfer_destination: None,
            post_call_fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Append a conversation turn. Timestamps are clamped so the history is
    /// monotonically non-decreasing even if the system clock steps back.
    pub fn push_turn(&mut self, role: TurnRole, content: impl Into<String>) {
        let mut timestamp = Utc::now();
        if let Some(last) = self.conversation_history.last() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp;
            }
        }
        self.conversation_history.push(TurnEntry {
            role,
            content: content.into(),
            timestamp,
        });
    }

    /// Record a completed tool execution
    pub fn record_tool_call(&mut self, invocation: ToolInvocation) {
        self.tool_calls.push(invocation);
    }

    /// Claim the one-shot post-call dispatch. Returns true exactly once.
    pub fn claim_post_call_dispatch(&self) -> bool {
        self.post_call_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn duration_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Snapshot this session into an immutable record for persistence
    pub fn to_record(&self, pipeline_components: Vec<String>, error_message: Option<String>) -> CallRecord {
        CallRecord {
            id: uuid::Uuid::new_v4().to_string(),
            call_id: self.call_id.clone(),
            caller_number: self.caller_number.clone(),
            called_number: self.called_number.clone(),
            context_name: self.context_name.clone(),
            direction: self.direction,
            start_time: self.started_at,
            end_time: Utc::now(),
            duration_seconds: self.duration_seconds(),
            provider_name: self.provider_name.clone(),
            pipeline_components,
            conversation_history: self.conversation_history.clone(),
            tool_calls: self.tool_calls.clone(),
            pre_call_results: self.pre_call_results.clone(),
            outcome: self.outcome,
            transfer_destination: self.transfer_destination.clone(),
            error_message,
            avg_turn_latency_ms: self.metrics.avg_turn_latency_ms,
            max_turn_latency_ms: self.metrics.max_turn_latency_ms,
            total_turns: self.metrics.total_turns,
            barge_in_count: self.metrics.barge_in_count,
            caller_audio_format: None,
        }
    }
}

/// Immutable, persisted copy of a completed call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub call_id: String,
    pub caller_number: String,
    pub called_number: String,
    pub context_name: String,
    pub direction: CallDirection,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: u64,
    pub provider_name: String,
    pub pipeline_components: Vec<String>,
    pub conversation_history: Vec<TurnEntry>,
    pub tool_calls: Vec<ToolInvocation>,
    pub pre_call_results: HashMap<String, String>,
    pub outcome: CallOutcome,
    pub transfer_destination: Option<String>,
    pub error_message: Option<String>,
    pub avg_turn_latency_ms: f64,
    pub max_turn_latency_ms: u64,
    pub total_turns: u32,
    pub barge_in_count: u32,
    /// Codec the caller leg arrived with, informational only
    pub caller_audio_format: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_timestamps_are_monotonic() {
        let mut session = CallSession::new("c1", "100", "200", "default", CallDirection::Inbound);
        for i in 0..50 {
            session.push_turn(TurnRole::User, format!("turn {i}"));
        }
        let history = &session.conversation_history;
        for pair in history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn post_call_dispatch_claims_once() {
        let session = CallSession::new("c1", "100", "200", "default", CallDirection::Inbound);
        let clone = session.clone();
        assert!(session.claim_post_call_dispatch());
        // the clone shares the guard, mirroring racing cleanup paths
        assert!(!clone.claim_post_call_dispatch());
        assert!(!session.claim_post_call_dispatch());
    }

    #[test]
    fn turn_latency_rolls_average_and_max() {
        let mut metrics = CallMetrics::default();
        metrics.record_turn_latency(100);
        metrics.record_turn_latency(300);
        assert_eq!(metrics.total_turns, 2);
        assert!((metrics.avg_turn_latency_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(metrics.max_turn_latency_ms, 300);
    }

    #[test]
    fn outcome_round_trips_through_str() {
        for outcome in [
            CallOutcome::Completed,
            CallOutcome::Transferred,
            CallOutcome::ConsentDenied,
            CallOutcome::VoicemailDropped,
            CallOutcome::Error,
        ] {
            assert_eq!(outcome.as_str().parse::<CallOutcome>().unwrap(), outcome);
        }
    }
}
