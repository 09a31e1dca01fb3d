//! OpenAI-compatible chat LLM adapter
//!
//! Speaks the `/chat/completions` shape most hosted and local inference
//! servers expose. Tool-calling support is uneven across them: some return
//! 4xx when `tools` is present at all. Those failures surface as
//! [`ProviderError::ToolsUnsupported`] so the pipeline can retry the turn
//! once without schemas.

use async_trait::async_trait;
use serde_json::{json, Value};

use phone_agent_config::HttpEndpointConfig;
use phone_agent_core::{
    ChatMessage, ChatRole, GenerateRequest, GenerateResponse, LanguageModel, ProviderError,
    ToolCallRequest,
};

/// OpenAI-compatible chat backend.
pub struct OpenAiCompatLlm {
    config: HttpEndpointConfig,
    client: reqwest::Client,
}

impl OpenAiCompatLlm {
    pub fn new(config: HttpEndpointConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()
            .expect("reqwest client");
        Self { config, client }
    }

    fn api_key(&self) -> Option<String> {
        self.config
            .api_key_env
            .as_ref()
            .and_then(|env_var| std::env::var(env_var).ok())
    }
}

/// Translate one message into the wire shape.
fn encode_message(message: &ChatMessage) -> Value {
    let role = match message.role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    };
    let mut encoded = json!({ "role": role, "content": message.content });
    if let Some(id) = &message.tool_call_id {
        encoded["tool_call_id"] = json!(id);
    }
    if !message.tool_calls.is_empty() {
        encoded["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    })
                })
                .collect(),
        );
    }
    encoded
}

/// 4xx bodies that mean "this server cannot do tool calling".
fn is_tools_unsupported(status: reqwest::StatusCode, body: &str) -> bool {
    status.is_client_error()
        && (body.contains("tool_use") || body.contains("tool_choice") || body.contains("tools"))
}

#[async_trait]
impl LanguageModel for OpenAiCompatLlm {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        let messages: Vec<Value> = request.messages.iter().map(encode_message).collect();

        let mut body = json!({
            "model": self.config.model.clone().unwrap_or_else(|| "default".into()),
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.clone());
        }

        let mut http_request = self.client.post(&self.config.url).json(&body);
        if let Some(key) = self.api_key() {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request
            .send()
            .await
            .map_err(|e| ProviderError::Request(format!("llm request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if !request.tools.is_empty() && is_tools_unsupported(status, &text) {
                return Err(ProviderError::ToolsUnsupported(format!("{status}: {text}")));
            }
            return Err(ProviderError::Request(format!("llm returned {status}: {text}")));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("llm response: {e}")))?;
        let message = parsed
            .pointer("/choices/0/message")
            .ok_or_else(|| ProviderError::Protocol("llm response had no choices".into()))?;

        let text = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();

        let tool_calls = message
            .get("tool_calls")
            .and_then(|calls| calls.as_array())
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let id = call.get("id")?.as_str()?.to_string();
                        let function = call.get("function")?;
                        let name = function.get("name")?.as_str()?.to_string();
                        let arguments = function
                            .get("arguments")
                            .and_then(|a| a.as_str())
                            .and_then(|raw| serde_json::from_str(raw).ok())
                            .unwrap_or(Value::Null);
                        Some(ToolCallRequest { id, name, arguments })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(GenerateResponse { text, tool_calls })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_messages_carry_their_call_id() {
        let encoded = encode_message(&ChatMessage::tool("call_7", "{\"ok\":true}"));
        assert_eq!(encoded["role"], "tool");
        assert_eq!(encoded["tool_call_id"], "call_7");
    }

    #[test]
    fn assistant_tool_calls_use_nested_function_shape() {
        let mut message = ChatMessage::assistant("");
        message.tool_calls.push(ToolCallRequest {
            id: "call_1".into(),
            name: "blind_transfer".into(),
            arguments: json!({"destination": "sales"}),
        });
        let encoded = encode_message(&message);
        assert_eq!(encoded["tool_calls"][0]["type"], "function");
        assert_eq!(encoded["tool_calls"][0]["function"]["name"], "blind_transfer");
        // arguments are a JSON string, not an object
        assert!(encoded["tool_calls"][0]["function"]["arguments"].is_string());
    }

    #[test]
    fn tools_unsupported_detection_requires_4xx_and_tool_mention() {
        let status_400 = reqwest::StatusCode::BAD_REQUEST;
        let status_500 = reqwest::StatusCode::INTERNAL_SERVER_ERROR;
        assert!(is_tools_unsupported(status_400, "tool_use is not supported"));
        assert!(!is_tools_unsupported(status_500, "tools broke"));
        assert!(!is_tools_unsupported(status_400, "rate limited"));
    }
}
