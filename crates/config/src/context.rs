//! Call contexts and tool configuration
//!
//! A context is the named bundle resolved per call: prompt, greeting,
//! provider, audio profile and tool lists. Tools are declared once in
//! configuration and referenced from contexts by name; global tools are
//! active everywhere unless a context opts out of their phase.

use phone_agent_core::{ToolDefinition, ToolParam, ToolPhase};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Named per-call bundle selected by DID, channel variable, or campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallContextConfig {
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub greeting_template: String,
    /// Provider (monolithic or pipeline) this context talks to
    pub provider: String,
    #[serde(default = "default_profile_name")]
    pub audio_profile: String,
    /// DIDs that resolve to this context for inbound calls
    #[serde(default)]
    pub dids: Vec<String>,
    #[serde(default)]
    pub pre_call_tools: Vec<String>,
    /// In-call allowlist, unioned with global in-call tools unless those
    /// are disabled below
    #[serde(default)]
    pub in_call_tools: Vec<String>,
    #[serde(default)]
    pub post_call_tools: Vec<String>,
    #[serde(default)]
    pub disable_global_pre_call: bool,
    #[serde(default)]
    pub disable_global_in_call: bool,
    #[serde(default)]
    pub disable_global_post_call: bool,
    /// Media URI played while slow pre-call tools hold the caller
    #[serde(default)]
    pub hold_prompt_media: Option<String>,
    /// Media URI played if the provider drops mid-call, before hangup
    #[serde(default)]
    pub failure_prompt_media: Option<String>,
}

fn default_profile_name() -> String {
    "telephony_ulaw_8k".to_string()
}

impl Default for CallContextConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            greeting_template: String::new(),
            provider: "default".to_string(),
            audio_profile: default_profile_name(),
            dids: Vec::new(),
            pre_call_tools: Vec::new(),
            in_call_tools: Vec::new(),
            post_call_tools: Vec::new(),
            disable_global_pre_call: false,
            disable_global_in_call: false,
            disable_global_post_call: false,
            hold_prompt_media: None,
            failure_prompt_media: None,
        }
    }
}

/// What a configured tool actually does when executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Built-in blind transfer through the PBX
    BlindTransfer {
        /// Named destinations, e.g. sales -> SIP/6000
        destinations: HashMap<String, String>,
        /// Caller-id identity presented on the new leg
        #[serde(default)]
        virtual_extension: Option<String>,
    },
    /// Built-in hangup with spoken farewell
    HangupCall,
    /// HTTP request (pre-call lookup, in-call lookup, or post-call webhook)
    Http(HttpToolConfig),
}

/// HTTP-backed tool settings. URL, headers and payload accept `{var}`
/// placeholders and `${ENV}` expansion at request-build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpToolConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// JSON body template; substituted then parsed
    #[serde(default)]
    pub payload_template: Option<String>,
    /// Map of output variable name -> JSON pointer into the response body.
    /// Empty means the raw JSON body is returned to the model.
    #[serde(default)]
    pub response_mapping: HashMap<String, String>,
    /// Post-call only: summarize the conversation and substitute
    /// {summary} / {summary_json} into the payload first
    #[serde(default)]
    pub generate_summary: bool,
    #[serde(default = "default_summary_max_words")]
    pub summary_max_words: u32,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_summary_max_words() -> u32 {
    80
}

/// One configured tool: canonical definition plus behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub phase: ToolPhase,
    #[serde(default)]
    pub is_global: bool,
    #[serde(default = "default_tool_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub parameters: Vec<ToolParam>,
    #[serde(default)]
    pub output_variables: Vec<String>,
    pub kind: ToolKind,
}

fn default_tool_timeout_ms() -> u64 {
    2000
}

impl ToolConfig {
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            phase: self.phase,
            is_global: self.is_global,
            timeout_ms: self.timeout_ms,
            parameters: self.parameters.clone(),
            output_variables: self.output_variables.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_tool_parses_from_yaml() {
        let yaml = r#"
name: crm_lookup
description: Look up the caller in the CRM
phase: pre_call
is_global: true
timeout_ms: 2000
output_variables: [customer_first_name, contact_id]
kind:
  http:
    url: "https://crm.example.com/lookup?number={caller_number}"
    method: GET
    headers:
      Authorization: "Bearer ${CRM_API_KEY}"
    response_mapping:
      customer_first_name: "/contact/first_name"
      contact_id: "/contact/id"
"#;
        let tool: ToolConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(tool.phase, ToolPhase::PreCall);
        assert!(tool.is_global);
        let definition = tool.to_definition();
        assert_eq!(definition.output_variables.len(), 2);
        match tool.kind {
            ToolKind::Http(http) => {
                assert_eq!(http.method, "GET");
                assert!(http.url.contains("{caller_number}"));
            }
            other => panic!("expected http tool, got {other:?}"),
        }
    }

    #[test]
    fn transfer_tool_parses_destinations() {
        let yaml = r#"
name: blind_transfer
phase: in_call
kind:
  blind_transfer:
    destinations:
      sales: SIP/6000
      support: SIP/6001
    virtual_extension: "7000"
"#;
        let tool: ToolConfig = serde_yaml::from_str(yaml).unwrap();
        match tool.kind {
            ToolKind::BlindTransfer { destinations, .. } => {
                assert_eq!(destinations.get("sales").unwrap(), "SIP/6000");
            }
            other => panic!("expected transfer tool, got {other:?}"),
        }
    }
}
