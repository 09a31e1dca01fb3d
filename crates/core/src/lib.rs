//! Core traits and types for the phone agent engine
//!
//! This crate provides foundational types used across all other crates:
//! - Audio format and profile types (wire vs provider formats)
//! - Call session state, conversation history, call records
//! - Unified tool definitions and phase contexts
//! - Provider traits (monolithic agent sessions, STT/LLM/TTS adapters)
//! - Chat message types shared by LLM adapters and tool loops

pub mod audio;
pub mod llm;
pub mod provider;
pub mod session;
pub mod tool;

pub use audio::{AudioEncoding, AudioFormat, AudioProfile, FRAME_MS};
pub use llm::{ChatMessage, ChatRole, GenerateRequest, GenerateResponse, ToolCallRequest};
pub use provider::{
    AgentEvent, AgentSession, AppliedSettings, GatePolicy, LanguageModel, ProviderCapabilities,
    ProviderError, SpeechToText, TextToSpeech, Transcript,
};
pub use session::{
    CallDirection, CallMetrics, CallOutcome, CallRecord, CallSession, CurrentAction, TurnEntry,
    TurnRole,
};
pub use tool::{
    CallIdentity, InCallContext, PostCallContext, PreCallContext, ToolDefinition, ToolInvocation,
    ToolOutput, ToolParam, ToolParamType, ToolPhase,
};
