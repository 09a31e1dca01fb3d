//! Unified tool definitions and phase contexts
//!
//! A tool is declared once with a canonical [`ToolDefinition`]; adapters in
//! the providers crate translate it to whatever schema shape a provider
//! expects. The phase decides when and how it runs: pre-call tools enrich
//! the prompt before the first agent speech, in-call tools answer the
//! model's function calls, post-call tools fire after cleanup and are never
//! awaited by the call path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::session::{CallDirection, CallOutcome, TurnEntry};

/// Lifecycle phase a tool runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    PreCall,
    InCall,
    PostCall,
}

/// Parameter types exposed in tool schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolParamType {
    #[default]
    String,
    Number,
    Boolean,
}

/// One declared tool parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ToolParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// Canonical tool definition, provider-agnostic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub phase: ToolPhase,
    /// Global tools are active in every context unless opted out
    #[serde(default)]
    pub is_global: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub parameters: Vec<ToolParam>,
    /// Variables a pre-call tool promises to produce. On timeout or error
    /// each resolves to the empty string.
    #[serde(default)]
    pub output_variables: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    2000
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, phase: ToolPhase) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            phase,
            is_global: false,
            timeout_ms: default_timeout_ms(),
            parameters: Vec::new(),
            output_variables: Vec::new(),
        }
    }
}

/// Result of one tool execution
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Raw result returned to the model (in-call) or logged (other phases)
    pub result: Value,
    /// Named string outputs merged into `pre_call_results`
    pub variables: HashMap<String, String>,
}

impl ToolOutput {
    pub fn json(result: Value) -> Self {
        Self {
            result,
            variables: HashMap::new(),
        }
    }

    pub fn variables(variables: HashMap<String, String>) -> Self {
        Self {
            result: Value::Null,
            variables,
        }
    }
}

/// A completed tool execution recorded on the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub params: Value,
    pub result: Value,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Call-scoped identity shared by all three phase contexts
#[derive(Debug, Clone)]
pub struct CallIdentity {
    pub call_id: String,
    pub direction: CallDirection,
    pub caller_number: String,
    pub called_number: String,
    pub context_name: String,
}

impl CallIdentity {
    /// Call-scoped variables available to template substitution
    pub fn variables(&self) -> HashMap<String, String> {
        HashMap::from([
            ("call_id".to_string(), self.call_id.clone()),
            ("caller_number".to_string(), self.caller_number.clone()),
            ("called_number".to_string(), self.called_number.clone()),
            ("context_name".to_string(), self.context_name.clone()),
            ("direction".to_string(), self.direction.to_string()),
        ])
    }
}

/// Context for pre-call enrichment tools
#[derive(Debug, Clone)]
pub struct PreCallContext {
    pub identity: CallIdentity,
    /// Campaign/lead custom variables for outbound calls
    pub custom_vars: HashMap<String, String>,
}

/// Context for in-call function calls
#[derive(Debug, Clone)]
pub struct InCallContext {
    pub identity: CallIdentity,
    pub pre_call_results: HashMap<String, String>,
}

/// Context handed to post-call tools after cleanup
#[derive(Debug, Clone)]
pub struct PostCallContext {
    pub identity: CallIdentity,
    pub duration_s: u64,
    pub outcome: CallOutcome,
    pub conversation_history: Vec<TurnEntry>,
    pub tool_calls: Vec<ToolInvocation>,
    pub pre_call_results: HashMap<String, String>,
    pub summary: Option<String>,
    pub provider_name: String,
}
