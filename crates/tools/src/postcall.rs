//! Post-call dispatch
//!
//! Fires after call cleanup in background tasks the call path never
//! awaits. No retries here; receiving systems own their retry policy. The
//! at-most-once guard lives on the session
//! (`CallSession::claim_post_call_dispatch`) and is checked by the engine
//! before this runs.

use serde_json::Value;
use std::sync::Arc;

use phone_agent_core::{ChatMessage, GenerateRequest, LanguageModel, PostCallContext, TurnRole};

use crate::registry::execute_timed;
use crate::{Tool, ToolContext};

/// LLM used for optional post-call summaries.
pub type Summarizer = Arc<dyn LanguageModel>;

/// Dispatch the post-call phase. Returns immediately; tools complete or
/// time out on their own timeouts in a detached task.
pub fn dispatch_post_call(
    tools: Vec<Arc<dyn Tool>>,
    mut ctx: PostCallContext,
    summarizer: Option<Summarizer>,
) {
    if tools.is_empty() {
        return;
    }

    tokio::spawn(async move {
        let max_words = tools
            .iter()
            .filter(|t| t.wants_summary())
            .map(|t| t.summary_max_words())
            .max();
        if let Some(max_words) = max_words {
            if ctx.summary.is_none() {
                match &summarizer {
                    Some(llm) => {
                        ctx.summary = generate_summary(llm, &ctx, max_words as usize).await;
                    }
                    None => tracing::warn!(
                        call_id = %ctx.identity.call_id,
                        "post-call tool wants a summary but no summarizer is configured"
                    ),
                }
            }
        }

        let context = ToolContext::PostCall(ctx);
        for tool in tools {
            let context = context.clone();
            tokio::spawn(async move {
                let (result, duration_ms) = execute_timed(&tool, &context, Value::Null).await;
                if let Err(e) = result {
                    // Log and drop; the call is already gone.
                    tracing::warn!(
                        tool = %tool.name(),
                        duration_ms,
                        "post-call tool failed: {e}"
                    );
                }
            });
        }
    });
}

async fn generate_summary(
    llm: &Summarizer,
    ctx: &PostCallContext,
    max_words: usize,
) -> Option<String> {
    let mut transcript = String::new();
    for entry in &ctx.conversation_history {
        let speaker = match entry.role {
            TurnRole::User => "Caller",
            TurnRole::Assistant => "Agent",
            TurnRole::System => continue,
        };
        transcript.push_str(speaker);
        transcript.push_str(": ");
        transcript.push_str(&entry.content);
        transcript.push('\n');
    }
    if transcript.is_empty() {
        return None;
    }

    let request = GenerateRequest::new(vec![
        ChatMessage::system(format!(
            "Summarize this phone call in at most {max_words} words. \
             Plain prose, no markdown."
        )),
        ChatMessage::user(transcript),
    ]);

    match llm.generate(request).await {
        Ok(response) => Some(bound_words(&response.text, max_words)),
        Err(e) => {
            tracing::warn!(call_id = %ctx.identity.call_id, "summary generation failed: {e}");
            None
        }
    }
}

/// Enforce the word bound even when the model ignores it.
fn bound_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        text.trim().to_string()
    } else {
        words[..max_words].join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ToolError, ToolRegistry};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use phone_agent_core::{
        CallDirection, CallIdentity, CallOutcome, ToolDefinition, ToolOutput, ToolPhase,
    };
    use std::collections::HashMap;

    struct CountingTool {
        definition: ToolDefinition,
        executions: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn definition(&self) -> &ToolDefinition {
            &self.definition
        }

        async fn execute(
            &self,
            _ctx: &ToolContext,
            _params: Value,
        ) -> Result<ToolOutput, ToolError> {
            *self.executions.lock() += 1;
            Ok(ToolOutput::default())
        }
    }

    fn post_ctx() -> PostCallContext {
        PostCallContext {
            identity: CallIdentity {
                call_id: "c1".into(),
                direction: CallDirection::Inbound,
                caller_number: "100".into(),
                called_number: "200".into(),
                context_name: "default".into(),
            },
            duration_s: 42,
            outcome: CallOutcome::Completed,
            conversation_history: Vec::new(),
            tool_calls: Vec::new(),
            pre_call_results: HashMap::new(),
            summary: None,
            provider_name: "test".into(),
        }
    }

    #[tokio::test]
    async fn dispatch_runs_tools_in_background() {
        let executions = Arc::new(Mutex::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CountingTool {
            definition: ToolDefinition::new("webhook", ToolPhase::PostCall),
            executions: executions.clone(),
        }));

        let tools = registry.collect_for_context(ToolPhase::PostCall, &["webhook".into()], false);
        dispatch_post_call(tools, post_ctx(), None);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(*executions.lock(), 1);
    }

    #[test]
    fn word_bound_truncates() {
        let text = "one two three four five";
        assert_eq!(bound_words(text, 3), "one two three");
        assert_eq!(bound_words(text, 10), text);
    }
}
