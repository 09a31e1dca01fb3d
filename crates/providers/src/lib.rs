//! Provider session manager
//!
//! Providers come in two variants behind one interface:
//!
//! - **Monolithic** ([`realtime`]): a single bidirectional WebSocket session
//!   that accepts audio and returns audio, transcripts and function calls.
//! - **Pipeline** ([`pipeline`]): separate STT / LLM / TTS adapters composed
//!   by an orchestrator that implements the same session contract.
//!
//! A [`registry::ProviderRegistry`] maps provider names to factories.
//! Hot swap is copy-on-write: reconfiguration builds a new registry and
//! swaps the pointer; in-flight calls keep the factory they started with.

pub mod llm;
pub mod pipeline;
pub mod realtime;
pub mod registry;
pub mod stt;
pub mod tts;

pub use pipeline::{PipelineFactory, PipelineTuning};
pub use realtime::RealtimeFactory;
pub use registry::{ProviderFactory, ProviderRegistry, SessionParams, SharedProviderRegistry};
