//! Pre-call enrichment against a slow lookup, end to end through the
//! tool registry and template substitution: the greeting must go out on
//! the tool's own timeout with its variables resolved to empty strings,
//! and the post-call context must carry those empty values literally.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use phone_agent_core::{
    CallDirection, CallIdentity, CallSession, PreCallContext, ToolDefinition, ToolOutput,
    ToolPhase,
};
use phone_agent_tools::{run_pre_call, substitute, Tool, ToolContext, ToolError, ToolRegistry};

/// Stand-in for an HTTP lookup whose endpoint stalls past the timeout.
struct StalledLookup {
    definition: ToolDefinition,
}

#[async_trait]
impl Tool for StalledLookup {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(&self, _ctx: &ToolContext, _params: Value) -> Result<ToolOutput, ToolError> {
        // Endpoint stalls 3000 ms against a 2000 ms tool timeout.
        tokio::time::sleep(Duration::from_millis(3000)).await;
        Ok(ToolOutput::variables(HashMap::from([
            ("customer_first_name".to_string(), "Ada".to_string()),
            ("contact_id".to_string(), "77".to_string()),
        ])))
    }
}

fn stalled_lookup() -> Arc<dyn Tool> {
    let mut definition = ToolDefinition::new("crm_lookup", ToolPhase::PreCall);
    definition.timeout_ms = 2000;
    definition.output_variables =
        vec!["customer_first_name".to_string(), "contact_id".to_string()];
    Arc::new(StalledLookup { definition })
}

#[tokio::test]
async fn greeting_plays_on_timeout_with_empty_variables() {
    let mut registry = ToolRegistry::new();
    registry.register(stalled_lookup());

    let mut session = CallSession::new("c1", "15551000", "15552000", "default", CallDirection::Inbound);
    let identity = CallIdentity {
        call_id: session.call_id.clone(),
        direction: session.direction,
        caller_number: session.caller_number.clone(),
        called_number: session.called_number.clone(),
        context_name: session.context_name.clone(),
    };

    let tools = registry.collect_for_context(ToolPhase::PreCall, &["crm_lookup".into()], false);
    let started = Instant::now();
    let (results, invocations) = run_pre_call(
        tools,
        PreCallContext {
            identity: identity.clone(),
            custom_vars: HashMap::new(),
        },
    )
    .await;

    // Bounded by the tool's own timeout, not the endpoint stall.
    assert!(
        started.elapsed() < Duration::from_millis(2100),
        "pre-call phase took {:?}",
        started.elapsed()
    );

    session.pre_call_results = results;
    for invocation in invocations {
        session.record_tool_call(invocation);
    }

    assert_eq!(session.pre_call_results.get("customer_first_name").unwrap(), "");
    assert_eq!(session.pre_call_results.get("contact_id").unwrap(), "");
    assert_eq!(session.tool_calls.len(), 1);

    // Greeting substitution sees the empty strings, not literals.
    let mut vars = identity.variables();
    vars.extend(session.pre_call_results.clone());
    let greeting = substitute("Hello {customer_first_name}, id {contact_id}, you are {caller_number}.", &vars);
    assert_eq!(greeting, "Hello , id , you are 15551000.");

    // The post-call payload carries the empty values literally.
    let payload = substitute(
        r#"{"contact_id": "{contact_id}", "caller": "{caller_number}"}"#,
        &vars,
    );
    assert_eq!(payload, r#"{"contact_id": "", "caller": "15551000"}"#);
}
