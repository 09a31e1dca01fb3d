//! Admin HTTP surface
//!
//! Narrow by design: health, Prometheus metrics, call-history reads,
//! campaign control and configuration reload. No endpoint accepts
//! arbitrary shell or raw SQL; mutations go through the same stores the
//! engine uses.

pub mod http;
pub mod metrics;

pub use http::create_router;
pub use metrics::{init_metrics, metrics_handler};

use phone_agent_engine::EngineHandles;

/// Shared state behind the admin router.
#[derive(Clone)]
pub struct AppState {
    pub handles: EngineHandles,
}
