//! Built-in tools and the registry builder
//!
//! The engine-facing built-ins (transfer, hangup) act through the
//! [`CallActions`] seam so this crate stays free of PBX plumbing; HTTP
//! tools cover pre-call lookups, in-call lookups and post-call webhooks
//! from one implementation parameterized by phase.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use phone_agent_config::{HttpToolConfig, Settings, ToolKind};
use phone_agent_core::{ToolDefinition, ToolOutput, ToolPhase};

use crate::substitute::{expand_env, substitute};
use crate::{Tool, ToolContext, ToolError, ToolRegistry};

/// Call-control operations the engine exposes to in-call tools.
#[async_trait]
pub trait CallActions: Send + Sync {
    /// Originate `dial_string` directly on the PBX, swap it into the
    /// caller's bridge and detach the AI media leg. Never via a Local
    /// channel; that breaks bidirectional audio.
    async fn blind_transfer(
        &self,
        call_id: &str,
        dial_string: &str,
        virtual_extension: Option<&str>,
    ) -> Result<(), ToolError>;

    /// Mark the call hangup-pending and have the agent speak `farewell`.
    /// The engine hangs up after the farewell audio completes.
    async fn hangup_with_farewell(&self, call_id: &str, farewell: &str) -> Result<(), ToolError>;
}

/// Blind transfer to a named destination.
pub struct BlindTransferTool {
    definition: ToolDefinition,
    destinations: HashMap<String, String>,
    virtual_extension: Option<String>,
    actions: Arc<dyn CallActions>,
}

impl BlindTransferTool {
    pub fn new(
        definition: ToolDefinition,
        destinations: HashMap<String, String>,
        virtual_extension: Option<String>,
        actions: Arc<dyn CallActions>,
    ) -> Self {
        Self {
            definition,
            destinations,
            virtual_extension,
            actions,
        }
    }
}

#[async_trait]
impl Tool for BlindTransferTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<ToolOutput, ToolError> {
        let ToolContext::InCall(in_call) = ctx else {
            return Err(ToolError::Execution("transfer is an in-call tool".into()));
        };
        let destination = params
            .get("destination")
            .and_then(|d| d.as_str())
            .ok_or_else(|| ToolError::InvalidParams("missing 'destination'".into()))?;

        // Accept either a configured name or a literal dial string.
        let dial_string = self
            .destinations
            .get(destination)
            .cloned()
            .or_else(|| destination.contains('/').then(|| destination.to_string()))
            .ok_or_else(|| {
                ToolError::InvalidParams(format!("unknown transfer destination '{destination}'"))
            })?;

        self.actions
            .blind_transfer(
                &in_call.identity.call_id,
                &dial_string,
                self.virtual_extension.as_deref(),
            )
            .await?;

        Ok(ToolOutput::json(json!({
            "status": "transferred",
            "destination": dial_string,
        })))
    }
}

/// Hangup with a spoken farewell. Returns success immediately; the engine
/// defers the actual hangup until the farewell audio has played out.
pub struct HangupTool {
    definition: ToolDefinition,
    actions: Arc<dyn CallActions>,
}

impl HangupTool {
    pub fn new(definition: ToolDefinition, actions: Arc<dyn CallActions>) -> Self {
        Self {
            definition,
            actions,
        }
    }
}

#[async_trait]
impl Tool for HangupTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<ToolOutput, ToolError> {
        let ToolContext::InCall(in_call) = ctx else {
            return Err(ToolError::Execution("hangup is an in-call tool".into()));
        };
        let farewell = params
            .get("farewell_message")
            .and_then(|m| m.as_str())
            .unwrap_or("Goodbye.");

        self.actions
            .hangup_with_farewell(&in_call.identity.call_id, farewell)
            .await?;

        Ok(ToolOutput::json(json!({
            "status": "ok",
            "message": farewell,
        })))
    }
}

/// HTTP-backed tool for any phase: lookup (pre/in-call) or webhook
/// (post-call). URL, headers and payload templates accept `{var}`
/// placeholders and `${ENV}`; env expansion happens here, per execution.
pub struct HttpTool {
    definition: ToolDefinition,
    config: HttpToolConfig,
    client: reqwest::Client,
}

impl HttpTool {
    pub fn new(definition: ToolDefinition, config: HttpToolConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(definition.timeout_ms.max(100)))
            .build()
            .expect("reqwest client");
        Self {
            definition,
            config,
            client,
        }
    }

    fn build_variables(&self, ctx: &ToolContext, params: &Value) -> HashMap<String, String> {
        let mut vars = ctx.variables();
        // AI-supplied parameters participate for in-call lookups.
        if let Value::Object(map) = params {
            for (key, value) in map {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                vars.insert(key.clone(), rendered);
            }
        }
        vars
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    fn wants_summary(&self) -> bool {
        self.definition.phase == ToolPhase::PostCall && self.config.generate_summary
    }

    fn summary_max_words(&self) -> u32 {
        self.config.summary_max_words
    }

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<ToolOutput, ToolError> {
        let vars = self.build_variables(ctx, &params);

        let url = expand_env(&substitute(&self.config.url, &vars));
        let mut request = match self.config.method.to_ascii_uppercase().as_str() {
            "GET" => self.client.get(&url),
            "PUT" => self.client.put(&url),
            "DELETE" => self.client.delete(&url),
            _ => self.client.post(&url),
        };
        for (name, value) in &self.config.headers {
            request = request.header(name, expand_env(&substitute(value, &vars)));
        }
        if let Some(template) = &self.config.payload_template {
            let body = expand_env(&substitute(template, &vars));
            let json_body: Value = serde_json::from_str(&body)
                .map_err(|e| ToolError::InvalidParams(format!("payload template: {e}")))?;
            request = request.json(&json_body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::Http(e.to_string()))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            return Err(ToolError::Http(format!("{url} returned {status}")));
        }

        // Map declared output variables out of the response, or hand the
        // raw JSON back to the model.
        if self.config.response_mapping.is_empty() {
            return Ok(ToolOutput::json(body));
        }
        let mut variables = HashMap::new();
        for (name, pointer) in &self.config.response_mapping {
            let value = body
                .pointer(pointer)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            variables.insert(name.clone(), value);
        }
        Ok(ToolOutput {
            result: body,
            variables,
        })
    }
}

/// Build a registry from one settings snapshot. This is also the hot-reload
/// entry point: reconfiguration builds a new registry and swaps it in.
pub fn build_registry(settings: &Settings, actions: Arc<dyn CallActions>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    for tool_config in &settings.tools {
        let definition = tool_config.to_definition();
        let tool: Arc<dyn Tool> = match &tool_config.kind {
            ToolKind::BlindTransfer {
                destinations,
                virtual_extension,
            } => Arc::new(BlindTransferTool::new(
                definition,
                destinations.clone(),
                virtual_extension.clone(),
                actions.clone(),
            )),
            ToolKind::HangupCall => Arc::new(HangupTool::new(definition, actions.clone())),
            ToolKind::Http(http_config) => {
                Arc::new(HttpTool::new(definition, http_config.clone()))
            }
        };
        registry.register(tool);
    }

    tracing::info!(tools = registry.len(), "tool registry built");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use phone_agent_core::{CallDirection, CallIdentity, InCallContext};

    #[derive(Default)]
    struct RecordingActions {
        transfers: Mutex<Vec<(String, String)>>,
        hangups: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CallActions for RecordingActions {
        async fn blind_transfer(
            &self,
            call_id: &str,
            dial_string: &str,
            _virtual_extension: Option<&str>,
        ) -> Result<(), ToolError> {
            self.transfers
                .lock()
                .push((call_id.to_string(), dial_string.to_string()));
            Ok(())
        }

        async fn hangup_with_farewell(
            &self,
            call_id: &str,
            farewell: &str,
        ) -> Result<(), ToolError> {
            self.hangups
                .lock()
                .push((call_id.to_string(), farewell.to_string()));
            Ok(())
        }
    }

    fn in_call_ctx() -> ToolContext {
        ToolContext::InCall(InCallContext {
            identity: CallIdentity {
                call_id: "c1".into(),
                direction: CallDirection::Inbound,
                caller_number: "15551000".into(),
                called_number: "15552000".into(),
                context_name: "sales".into(),
            },
            pre_call_results: HashMap::from([("contact_id".to_string(), "77".to_string())]),
        })
    }

    #[tokio::test]
    async fn transfer_resolves_named_destination() {
        let actions = Arc::new(RecordingActions::default());
        let tool = BlindTransferTool::new(
            ToolDefinition::new("blind_transfer", ToolPhase::InCall),
            HashMap::from([("sales".to_string(), "SIP/6000".to_string())]),
            Some("7000".into()),
            actions.clone(),
        );

        let output = tool
            .execute(&in_call_ctx(), json!({"destination": "sales"}))
            .await
            .unwrap();
        assert_eq!(output.result["destination"], "SIP/6000");
        assert_eq!(actions.transfers.lock()[0].1, "SIP/6000");
    }

    #[tokio::test]
    async fn transfer_rejects_unknown_destination() {
        let actions = Arc::new(RecordingActions::default());
        let tool = BlindTransferTool::new(
            ToolDefinition::new("blind_transfer", ToolPhase::InCall),
            HashMap::new(),
            None,
            actions,
        );
        let result = tool
            .execute(&in_call_ctx(), json!({"destination": "nowhere"}))
            .await;
        assert!(matches!(result, Err(ToolError::InvalidParams(_))));
    }

    #[tokio::test]
    async fn hangup_returns_immediately_with_farewell() {
        let actions = Arc::new(RecordingActions::default());
        let tool = HangupTool::new(
            ToolDefinition::new("hangup_call", ToolPhase::InCall),
            actions.clone(),
        );
        let output = tool
            .execute(&in_call_ctx(), json!({"farewell_message": "Goodbye."}))
            .await
            .unwrap();
        assert_eq!(output.result["status"], "ok");
        assert_eq!(output.result["message"], "Goodbye.");
        assert_eq!(actions.hangups.lock()[0].1, "Goodbye.");
    }

    #[test]
    fn http_tool_merges_params_over_context_vars() {
        let tool = HttpTool::new(
            ToolDefinition::new("lookup", ToolPhase::InCall),
            HttpToolConfig {
                url: "http://x/{caller_number}".into(),
                method: "GET".into(),
                headers: HashMap::new(),
                payload_template: None,
                response_mapping: HashMap::new(),
                generate_summary: false,
                summary_max_words: 80,
            },
        );
        let vars = tool.build_variables(&in_call_ctx(), &json!({"order_id": 42}));
        assert_eq!(vars.get("caller_number").unwrap(), "15551000");
        assert_eq!(vars.get("contact_id").unwrap(), "77");
        assert_eq!(vars.get("order_id").unwrap(), "42");
    }
}
