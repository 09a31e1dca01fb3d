//! Layered configuration for the phone agent engine
//!
//! Settings are resolved at startup with the priority
//! env vars > `config/{env}.yaml` > `config/default.yaml` > built-in
//! defaults. Credentials are only ever read from the environment.
//!
//! A documented subset (tool definitions, context → provider selection) is
//! hot-reloadable: [`ConfigManager`] rebuilds a full snapshot and swaps it
//! atomically; calls in flight keep the snapshot they started with.

pub mod context;
pub mod profiles;
pub mod settings;

pub use context::{CallContextConfig, HttpToolConfig, ToolConfig, ToolKind};
pub use profiles::{AudioProfileConfig, FormatConfig, MediaTransportKind};
pub use settings::{
    load_settings, AsteriskConfig, ChunkSize, DialerConfig, GatingConfig, HttpEndpointConfig,
    MediaConfig, ObservabilityConfig, PersistenceConfig, PlaybackConfig, ProviderConfig,
    ProviderKind, RuntimeEnvironment, ServerConfig, Settings,
};

use parking_lot::RwLock;
use std::sync::Arc;

/// Configuration errors. Fatal at startup; a failed hot reload leaves the
/// previous snapshot in place.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid audio profile '{profile}': {reason}")]
    InvalidProfile { profile: String, reason: String },

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("unknown audio profile '{0}'")]
    UnknownProfile(String),

    #[error("missing credential: environment variable {0} is not set")]
    MissingCredential(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Copy-on-write holder for the active settings snapshot.
///
/// Readers clone the `Arc`; a reload builds and validates a whole new
/// `Settings` before the swap, so in-flight calls never observe a half
/// -applied change.
pub struct ConfigManager {
    current: RwLock<Arc<Settings>>,
}

impl ConfigManager {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    /// Snapshot of the active configuration.
    pub fn get(&self) -> Arc<Settings> {
        self.current.read().clone()
    }

    /// Validate and atomically publish a new snapshot.
    pub fn reload(&self, settings: Settings) -> Result<(), ConfigError> {
        settings.validate()?;
        let mut guard = self.current.write();
        tracing::info!(
            contexts = settings.contexts.len(),
            providers = settings.providers.len(),
            tools = settings.tools.len(),
            "configuration snapshot swapped"
        );
        *guard = Arc::new(settings);
        Ok(())
    }
}
