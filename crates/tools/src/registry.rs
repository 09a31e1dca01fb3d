//! Tool registry
//!
//! Holds every configured tool keyed by name and indexed by phase, and
//! owns execution: per-tool timeout, monotonic duration timing, and the
//! phase/tool metrics. Hot reload swaps a whole registry pointer; calls in
//! flight keep the registry snapshot they started with.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use phone_agent_core::{ToolDefinition, ToolOutput, ToolPhase};

use crate::{Tool, ToolContext, ToolError};

/// Immutable name -> tool map for one configuration snapshot.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self, phase: ToolPhase) -> Vec<&ToolDefinition> {
        self.tools
            .values()
            .map(|t| t.definition())
            .filter(|d| d.phase == phase)
            .collect()
    }

    /// Tools active for one context in one phase:
    /// (global tools of the phase, unless opted out) ∪ (explicit list).
    pub fn collect_for_context(
        &self,
        phase: ToolPhase,
        explicit: &[String],
        disable_global: bool,
    ) -> Vec<Arc<dyn Tool>> {
        let mut selected: Vec<Arc<dyn Tool>> = Vec::new();
        let mut seen: Vec<&str> = Vec::new();

        if !disable_global {
            for tool in self.tools.values() {
                let def = tool.definition();
                if def.phase == phase && def.is_global {
                    seen.push(&def.name);
                    selected.push(tool.clone());
                }
            }
        }
        for name in explicit {
            if seen.iter().any(|s| s == name) {
                continue;
            }
            match self.tools.get(name) {
                Some(tool) if tool.definition().phase == phase => selected.push(tool.clone()),
                Some(tool) => tracing::warn!(
                    tool = %name,
                    phase = ?tool.definition().phase,
                    "tool listed for the wrong phase, skipping"
                ),
                None => tracing::warn!(tool = %name, "configured tool not in registry"),
            }
        }
        selected
    }

    /// Execute by name with the tool's own timeout. Returns the output and
    /// the measured duration.
    pub async fn execute(
        &self,
        name: &str,
        ctx: &ToolContext,
        params: Value,
    ) -> (Result<ToolOutput, ToolError>, u64) {
        match self.get(name) {
            Some(tool) => execute_timed(&tool, ctx, params).await,
            None => (Err(ToolError::NotFound(name.to_string())), 0),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one tool with its declared timeout, timing the execution with a
/// monotonic clock.
pub async fn execute_timed(
    tool: &Arc<dyn Tool>,
    ctx: &ToolContext,
    params: Value,
) -> (Result<ToolOutput, ToolError>, u64) {
    let definition = tool.definition();
    let timeout = Duration::from_millis(definition.timeout_ms);
    let phase = match ctx {
        ToolContext::PreCall(_) => "pre_call",
        ToolContext::InCall(_) => "in_call",
        ToolContext::PostCall(_) => "post_call",
    };

    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, tool.execute(ctx, params)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(ToolError::Timeout {
            tool: definition.name.clone(),
            timeout_ms: definition.timeout_ms,
        }),
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    metrics::histogram!(
        "tool_execution_duration_ms",
        "phase" => phase,
        "tool" => definition.name.clone(),
    )
    .record(duration_ms as f64);

    if let Err(e) = &result {
        tracing::warn!(tool = %definition.name, phase, duration_ms, "tool failed: {e}");
    } else {
        tracing::debug!(tool = %definition.name, phase, duration_ms, "tool executed");
    }

    (result, duration_ms)
}

/// Copy-on-write registry pointer for hot reload.
pub struct SharedToolRegistry {
    current: RwLock<Arc<ToolRegistry>>,
}

impl SharedToolRegistry {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    /// Calls snapshot this at start and keep the `Arc` for their lifetime.
    pub fn snapshot(&self) -> Arc<ToolRegistry> {
        self.current.read().clone()
    }

    pub fn swap(&self, registry: ToolRegistry) {
        tracing::info!(tools = registry.len(), "tool registry swapped");
        *self.current.write() = Arc::new(registry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use phone_agent_core::{CallDirection, CallIdentity, PreCallContext};

    struct SleepyTool {
        definition: ToolDefinition,
        sleep_ms: u64,
    }

    #[async_trait]
    impl Tool for SleepyTool {
        fn definition(&self) -> &ToolDefinition {
            &self.definition
        }

        async fn execute(&self, _ctx: &ToolContext, _params: Value) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
            Ok(ToolOutput::json(serde_json::json!({"ok": true})))
        }
    }

    fn sleepy(name: &str, phase: ToolPhase, is_global: bool, sleep_ms: u64, timeout_ms: u64) -> Arc<dyn Tool> {
        let mut definition = ToolDefinition::new(name, phase);
        definition.is_global = is_global;
        definition.timeout_ms = timeout_ms;
        Arc::new(SleepyTool {
            definition,
            sleep_ms,
        })
    }

    fn ctx() -> ToolContext {
        ToolContext::PreCall(PreCallContext {
            identity: CallIdentity {
                call_id: "c1".into(),
                direction: CallDirection::Inbound,
                caller_number: "100".into(),
                called_number: "200".into(),
                context_name: "default".into(),
            },
            custom_vars: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn timeout_is_enforced_per_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(sleepy("slow", ToolPhase::PreCall, false, 5000, 50));

        let (result, duration) = registry.execute("slow", &ctx(), Value::Null).await;
        assert!(matches!(result, Err(ToolError::Timeout { .. })));
        assert!(duration >= 50 && duration < 1000, "duration {duration}");
    }

    #[tokio::test]
    async fn duration_is_measured() {
        let mut registry = ToolRegistry::new();
        registry.register(sleepy("quick", ToolPhase::PreCall, false, 20, 1000));
        let (result, duration) = registry.execute("quick", &ctx(), Value::Null).await;
        assert!(result.is_ok());
        assert!(duration >= 20, "duration {duration}");
    }

    #[test]
    fn context_collection_unions_global_and_explicit() {
        let mut registry = ToolRegistry::new();
        registry.register(sleepy("global_crm", ToolPhase::PreCall, true, 0, 100));
        registry.register(sleepy("local_lookup", ToolPhase::PreCall, false, 0, 100));
        registry.register(sleepy("webhook", ToolPhase::PostCall, true, 0, 100));

        let selected =
            registry.collect_for_context(ToolPhase::PreCall, &["local_lookup".into()], false);
        let mut names: Vec<&str> = selected.iter().map(|t| t.name()).collect();
        names.sort();
        assert_eq!(names, vec!["global_crm", "local_lookup"]);

        // Opting out of globals leaves only the explicit list.
        let selected =
            registry.collect_for_context(ToolPhase::PreCall, &["local_lookup".into()], true);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name(), "local_lookup");
    }

    #[test]
    fn swap_preserves_inflight_snapshots() {
        let mut registry = ToolRegistry::new();
        registry.register(sleepy("a", ToolPhase::InCall, false, 0, 100));
        let shared = SharedToolRegistry::new(registry);

        let snapshot = shared.snapshot();
        shared.swap(ToolRegistry::new());
        assert!(snapshot.has("a"));
        assert!(!shared.snapshot().has("a"));
    }
}
