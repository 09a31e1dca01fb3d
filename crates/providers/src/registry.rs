//! Provider registry and session factory contract

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use phone_agent_config::{ProviderKind, Settings};
use phone_agent_core::{
    AgentEvent, AgentSession, AudioFormat, ProviderCapabilities, ProviderError,
};

use crate::llm::OpenAiCompatLlm;
use crate::pipeline::PipelineFactory;
use crate::realtime::RealtimeFactory;
use crate::stt::HttpStt;
use crate::tts::HttpTts;

/// Everything a factory needs to start one call's session
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub call_id: String,
    /// Format the engine will push to the session
    pub input_format: AudioFormat,
    /// Format the session is expected to emit
    pub output_format: AudioFormat,
    /// Templated system prompt
    pub instructions: String,
    /// Tool schemas already translated to this provider's shape
    pub tools: Vec<Value>,
    pub greeting: Option<String>,
}

/// Builds provider sessions. Instances are values held by the registry;
/// one factory serves many concurrent calls.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Component names recorded on the call record
    fn pipeline_components(&self) -> Vec<String>;

    /// Open a session. The returned receiver carries the session's events;
    /// it yields `AgentEvent::Closed` exactly once at the end.
    async fn start(
        &self,
        params: SessionParams,
    ) -> Result<(Arc<dyn AgentSession>, mpsc::Receiver<AgentEvent>), ProviderError>;
}

/// Immutable name -> factory map built from one settings snapshot.
pub struct ProviderRegistry {
    factories: HashMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Build all configured providers.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut factories: HashMap<String, Arc<dyn ProviderFactory>> = HashMap::new();

        for (name, provider) in &settings.providers {
            match provider.kind {
                ProviderKind::Monolithic => {
                    factories.insert(
                        name.clone(),
                        Arc::new(RealtimeFactory::new(name.clone(), provider.clone())),
                    );
                }
                ProviderKind::Pipeline => {
                    let (Some(stt), Some(llm), Some(tts)) =
                        (&provider.stt, &provider.llm, &provider.tts)
                    else {
                        tracing::error!(
                            provider = %name,
                            "pipeline provider missing stt/llm/tts endpoints, skipping"
                        );
                        continue;
                    };
                    factories.insert(
                        name.clone(),
                        Arc::new(PipelineFactory::new(
                            name.clone(),
                            provider.clone(),
                            Arc::new(HttpStt::new(stt.clone())),
                            Arc::new(OpenAiCompatLlm::new(llm.clone())),
                            Arc::new(HttpTts::new(tts.clone())),
                        )),
                    );
                }
            }
        }

        tracing::info!(providers = factories.len(), "provider registry built");
        Self { factories }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// Copy-on-write registry pointer. Calls snapshot the `Arc` at start and
/// keep it for their lifetime; a reload swaps the pointer for new calls.
pub struct SharedProviderRegistry {
    current: RwLock<Arc<ProviderRegistry>>,
}

impl SharedProviderRegistry {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    pub fn snapshot(&self) -> Arc<ProviderRegistry> {
        self.current.read().clone()
    }

    pub fn swap(&self, registry: ProviderRegistry) {
        tracing::info!(providers = registry.len(), "provider registry swapped");
        *self.current.write() = Arc::new(registry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phone_agent_config::{HttpEndpointConfig, ProviderConfig};
    use phone_agent_core::GatePolicy;

    fn pipeline_provider() -> ProviderConfig {
        let endpoint = HttpEndpointConfig {
            url: "http://127.0.0.1:9000".into(),
            api_key_env: None,
            model: None,
            timeout_ms: 5000,
        };
        ProviderConfig {
            kind: ProviderKind::Pipeline,
            gate_policy: GatePolicy::LocalGate,
            url: None,
            api_key_env: None,
            model: None,
            voice: None,
            handshake_timeout_s: 5,
            keepalive_interval_s: 20,
            supported_input: vec![],
            supported_output: vec![],
            stt: Some(endpoint.clone()),
            llm: Some(endpoint.clone()),
            tts: Some(endpoint),
        }
    }

    #[test]
    fn registry_builds_configured_pipelines() {
        let mut settings = Settings::default();
        settings
            .providers
            .insert("local_stack".into(), pipeline_provider());
        let registry = ProviderRegistry::from_settings(&settings);
        assert!(registry.get("local_stack").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn swap_leaves_existing_snapshots_untouched() {
        let mut settings = Settings::default();
        settings
            .providers
            .insert("local_stack".into(), pipeline_provider());
        let shared = SharedProviderRegistry::new(ProviderRegistry::from_settings(&settings));

        let old_snapshot = shared.snapshot();
        shared.swap(ProviderRegistry::empty());

        // In-flight call keeps its provider; new calls see the empty map.
        assert!(old_snapshot.get("local_stack").is_some());
        assert!(shared.snapshot().get("local_stack").is_none());
    }
}
