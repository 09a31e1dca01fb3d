//! Call engine
//!
//! Per-call orchestration tying the other crates together:
//!
//! - [`engine::CallEngine`]: the ARI event loop, call lifecycle (answer,
//!   context resolution, media accept, transport planning, pre-call tools,
//!   provider start, cleanup) and outbound AMD branching
//! - [`coordinator`]: the single-threaded per-call turn loop
//! - [`gating`]: the inbound audio gate and barge-in detector
//! - [`store`]: live call sessions, one handle per active call
//!
//! Every call occupies a small fixed set of tasks (ingress, provider
//! events, egress pacer); session state is mutated only on the call's
//! coordinator task. A single call's failure terminates that call's loop
//! and never the process.

pub mod coordinator;
pub mod engine;
pub mod gating;
pub mod media;
pub mod store;

pub use engine::{CallEngine, EngineHandles};
pub use gating::{FrameDecision, GateState, GatingManager};
pub use store::{CallCommand, CallHandle, SessionStore};

use phone_agent_core::ProviderError;
use phone_agent_persistence::PersistenceError;
use phone_agent_transport::TransportError;

/// Engine-level errors. All of these are call-scoped; the engine loop
/// catches them at the call boundary and the process keeps serving.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("no context resolves for this call: {0}")]
    NoContext(String),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("unknown audio profile '{0}'")]
    UnknownProfile(String),

    #[error("media channel never arrived: {0}")]
    MediaTimeout(String),

    #[error("call ended: {0}")]
    CallEnded(String),
}
