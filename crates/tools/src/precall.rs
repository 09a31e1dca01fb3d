//! Pre-call enrichment phase
//!
//! All of a context's pre-call tools run in parallel, each bounded by its
//! own timeout, so the caller waits no longer than the slowest configured
//! tool. A tool that fails or times out resolves every one of its declared
//! output variables to the empty string; the greeting always has a value
//! to substitute.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use phone_agent_core::{PreCallContext, ToolInvocation};

use crate::registry::execute_timed;
use crate::{Tool, ToolContext};

/// Run the pre-call phase. Returns the merged variable map plus the
/// invocation records for the session's tool-call log.
pub async fn run_pre_call(
    tools: Vec<Arc<dyn Tool>>,
    ctx: PreCallContext,
) -> (HashMap<String, String>, Vec<ToolInvocation>) {
    if tools.is_empty() {
        return (HashMap::new(), Vec::new());
    }

    let context = ToolContext::PreCall(ctx);
    let executions = tools.iter().map(|tool| {
        let context = context.clone();
        async move {
            let (result, duration_ms) = execute_timed(tool, &context, Value::Null).await;
            (tool.clone(), result, duration_ms)
        }
    });
    let completed = futures::future::join_all(executions).await;

    let mut merged = HashMap::new();
    let mut invocations = Vec::new();

    for (tool, result, duration_ms) in completed {
        let definition = tool.definition();
        let (result_value, variables) = match result {
            Ok(output) => {
                let mut variables = output.variables;
                // Declared variables the tool did not produce resolve empty.
                for name in &definition.output_variables {
                    variables.entry(name.clone()).or_default();
                }
                (output.result, variables)
            }
            Err(e) => {
                let empty: HashMap<String, String> = definition
                    .output_variables
                    .iter()
                    .map(|name| (name.clone(), String::new()))
                    .collect();
                (serde_json::json!({"error": e.to_string()}), empty)
            }
        };

        merged.extend(variables);
        invocations.push(ToolInvocation {
            name: definition.name.clone(),
            params: Value::Null,
            result: result_value,
            timestamp: Utc::now(),
            duration_ms,
        });
    }

    (merged, invocations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolError;
    use async_trait::async_trait;
    use phone_agent_core::{CallDirection, CallIdentity, ToolDefinition, ToolOutput, ToolPhase};
    use std::time::{Duration, Instant};

    struct StubTool {
        definition: ToolDefinition,
        sleep_ms: u64,
        variables: HashMap<String, String>,
    }

    #[async_trait]
    impl Tool for StubTool {
        fn definition(&self) -> &ToolDefinition {
            &self.definition
        }

        async fn execute(
            &self,
            _ctx: &ToolContext,
            _params: Value,
        ) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
            Ok(ToolOutput::variables(self.variables.clone()))
        }
    }

    fn stub(
        name: &str,
        sleep_ms: u64,
        timeout_ms: u64,
        outputs: &[(&str, &str)],
    ) -> Arc<dyn Tool> {
        let mut definition = ToolDefinition::new(name, ToolPhase::PreCall);
        definition.timeout_ms = timeout_ms;
        definition.output_variables = outputs.iter().map(|(k, _)| k.to_string()).collect();
        Arc::new(StubTool {
            definition,
            sleep_ms,
            variables: outputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }

    fn ctx() -> PreCallContext {
        PreCallContext {
            identity: CallIdentity {
                call_id: "c1".into(),
                direction: CallDirection::Inbound,
                caller_number: "100".into(),
                called_number: "200".into(),
                context_name: "default".into(),
            },
            custom_vars: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn tools_run_in_parallel_not_sequentially() {
        // Three tools at 100 ms each: parallel wall time stays near 100 ms.
        let tools = vec![
            stub("a", 100, 2000, &[("x", "1")]),
            stub("b", 100, 2000, &[("y", "2")]),
            stub("c", 100, 2000, &[("z", "3")]),
        ];
        let started = Instant::now();
        let (merged, invocations) = run_pre_call(tools, ctx()).await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(250), "took {elapsed:?}");
        assert_eq!(merged.len(), 3);
        assert_eq!(invocations.len(), 3);
    }

    #[tokio::test]
    async fn timed_out_tool_resolves_variables_to_empty() {
        // Endpoint stalls past its own timeout.
        let tools = vec![stub(
            "crm_lookup",
            3000,
            200,
            &[("customer_first_name", "Ada"), ("contact_id", "77")],
        )];
        let started = Instant::now();
        let (merged, invocations) = run_pre_call(tools, ctx()).await;

        // Bounded by the tool timeout, not the stall.
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(merged.get("customer_first_name").unwrap(), "");
        assert_eq!(merged.get("contact_id").unwrap(), "");
        assert!(invocations[0].result.get("error").is_some());
    }

    #[tokio::test]
    async fn durations_are_recorded() {
        let tools = vec![stub("a", 30, 2000, &[("x", "1")])];
        let (_, invocations) = run_pre_call(tools, ctx()).await;
        assert!(invocations[0].duration_ms >= 30);
    }
}
