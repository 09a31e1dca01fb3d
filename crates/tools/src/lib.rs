//! Tool execution subsystem
//!
//! Tools are declared once (canonical [`ToolDefinition`]) and run in one of
//! three lifecycle phases:
//!
//! - **pre-call**: enrichment lookups executed in parallel after answer,
//!   before the first agent speech; outputs become prompt variables
//! - **in-call**: function calls requested by the model, answered within
//!   the provider's deadline
//! - **post-call**: fire-and-forget webhooks after cleanup, guarded so they
//!   dispatch at most once per call
//!
//! [`registry::ToolRegistry`] indexes tools by phase; [`schema`] exports
//! provider-specific schema shapes as pure translation functions.

pub mod builtin;
pub mod postcall;
pub mod precall;
pub mod registry;
pub mod schema;
pub mod substitute;

pub use builtin::{build_registry, CallActions};
pub use postcall::{dispatch_post_call, Summarizer};
pub use precall::run_pre_call;
pub use registry::{SharedToolRegistry, ToolRegistry};
pub use substitute::{expand_env, substitute, MAX_VARIABLE_LEN};

use async_trait::async_trait;
use serde_json::Value;

use phone_agent_core::{InCallContext, PostCallContext, PreCallContext, ToolDefinition, ToolOutput};

/// Errors scoped to one tool execution. Pre-call failures resolve output
/// variables to empty strings; in-call failures are returned to the model
/// as an error payload; post-call failures are logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool '{tool}' timed out after {timeout_ms} ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("http request failed: {0}")]
    Http(String),

    #[error("tool execution failed: {0}")]
    Execution(String),
}

/// Phase-specific execution context, constructed at the boundary where
/// that phase starts.
#[derive(Debug, Clone)]
pub enum ToolContext {
    PreCall(PreCallContext),
    InCall(InCallContext),
    PostCall(PostCallContext),
}

impl ToolContext {
    /// Variables available to template substitution in this phase.
    pub fn variables(&self) -> std::collections::HashMap<String, String> {
        match self {
            ToolContext::PreCall(ctx) => {
                let mut vars = ctx.identity.variables();
                vars.extend(ctx.custom_vars.clone());
                vars
            }
            ToolContext::InCall(ctx) => {
                let mut vars = ctx.identity.variables();
                vars.extend(ctx.pre_call_results.clone());
                vars
            }
            ToolContext::PostCall(ctx) => {
                let mut vars = ctx.identity.variables();
                vars.extend(ctx.pre_call_results.clone());
                vars.insert("outcome".to_string(), ctx.outcome.to_string());
                vars.insert("duration_s".to_string(), ctx.duration_s.to_string());
                vars.insert("provider_name".to_string(), ctx.provider_name.clone());
                if let Some(summary) = &ctx.summary {
                    vars.insert("summary".to_string(), summary.clone());
                    vars.insert(
                        "summary_json".to_string(),
                        serde_json::to_string(summary).unwrap_or_default(),
                    );
                }
                vars
            }
        }
    }
}

/// One executable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    fn name(&self) -> &str {
        &self.definition().name
    }

    /// Post-call HTTP tools that want a conversation summary generated
    /// before their payload is built return true here.
    fn wants_summary(&self) -> bool {
        false
    }

    /// Word bound for the generated summary, when requested.
    fn summary_max_words(&self) -> u32 {
        80
    }

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<ToolOutput, ToolError>;
}
