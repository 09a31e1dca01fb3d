//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use phone_agent_core::GatePolicy;

use crate::context::{CallContextConfig, ToolConfig};
use crate::profiles::{AudioProfileConfig, FormatConfig};
use crate::ConfigError;

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    /// PBX control-plane connection (ARI)
    #[serde(default)]
    pub asterisk: AsteriskConfig,

    /// Media transports (AudioSocket / RTP)
    #[serde(default)]
    pub media: MediaConfig,

    /// Admin HTTP surface
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub gating: GatingConfig,

    #[serde(default)]
    pub dialer: DialerConfig,

    /// Named providers (monolithic agents and modular pipelines)
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Named audio profiles
    #[serde(default = "default_profiles")]
    pub profiles: HashMap<String, AudioProfileConfig>,

    /// Named call contexts
    #[serde(default)]
    pub contexts: HashMap<String, CallContextConfig>,

    /// Context used when nothing else resolves
    #[serde(default = "default_context_name")]
    pub default_context: String,

    /// Declared tools, all phases
    #[serde(default)]
    pub tools: Vec<ToolConfig>,

    /// LLM endpoint used for post-call summaries
    #[serde(default)]
    pub summarizer: Option<HttpEndpointConfig>,
}

fn default_context_name() -> String {
    "default".to_string()
}

fn default_profiles() -> HashMap<String, AudioProfileConfig> {
    HashMap::from([(
        "telephony_ulaw_8k".to_string(),
        AudioProfileConfig::default(),
    )])
}

/// ARI connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsteriskConfig {
    #[serde(default = "default_asterisk_host")]
    pub host: String,
    #[serde(default = "default_ari_port")]
    pub ari_port: u16,
    #[serde(default = "default_ari_username")]
    pub ari_username: String,
    /// Read from ARI_PASSWORD; never stored in files
    #[serde(default = "default_ari_password")]
    pub ari_password: String,
    #[serde(default = "default_stasis_app")]
    pub stasis_app: String,
}

fn default_asterisk_host() -> String {
    std::env::var("ASTERISK_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_ari_port() -> u16 {
    std::env::var("ARI_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8088)
}

fn default_ari_username() -> String {
    std::env::var("ARI_USERNAME").unwrap_or_else(|_| "phone-agent".to_string())
}

fn default_ari_password() -> String {
    std::env::var("ARI_PASSWORD").unwrap_or_default()
}

fn default_stasis_app() -> String {
    "phone-agent".to_string()
}

impl Default for AsteriskConfig {
    fn default() -> Self {
        Self {
            host: default_asterisk_host(),
            ari_port: default_ari_port(),
            ari_username: default_ari_username(),
            ari_password: default_ari_password(),
            stasis_app: default_stasis_app(),
        }
    }
}

/// Media transport bind settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_audiosocket_bind")]
    pub audiosocket_bind: String,
    #[serde(default = "default_rtp_bind_host")]
    pub rtp_bind_host: String,
    #[serde(default = "default_rtp_port_min")]
    pub rtp_port_min: u16,
    #[serde(default = "default_rtp_port_max")]
    pub rtp_port_max: u16,
}

fn default_audiosocket_bind() -> String {
    std::env::var("AUDIOSOCKET_BIND").unwrap_or_else(|_| "0.0.0.0:9092".to_string())
}

fn default_rtp_bind_host() -> String {
    std::env::var("RTP_BIND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn default_rtp_port_min() -> u16 {
    10000
}

fn default_rtp_port_max() -> u16 {
    10500
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audiosocket_bind: default_audiosocket_bind(),
            rtp_bind_host: default_rtp_bind_host(),
            rtp_port_min: default_rtp_port_min(),
            rtp_port_max: default_rtp_port_max(),
        }
    }
}

/// Admin HTTP surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    std::env::var("HEALTH_BIND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn default_server_port() -> u16 {
    std::env::var("HEALTH_BIND_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// Embedded database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// 0 disables the retention sweep
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_database_path() -> String {
    std::env::var("DATABASE_PATH").unwrap_or_else(|_| "data/phone-agent.db".to_string())
}

fn default_retention_days() -> u32 {
    std::env::var("RETENTION_DAYS")
        .ok()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0)
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            retention_days: default_retention_days(),
        }
    }
}

/// Egress frame size selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkSize {
    Ms10,
    Ms20,
    Ms40,
    #[default]
    Auto,
}

impl ChunkSize {
    /// Resolved frame duration; `auto` is 20 ms
    pub fn as_ms(&self) -> u32 {
        match self {
            ChunkSize::Ms10 => 10,
            ChunkSize::Ms20 | ChunkSize::Auto => 20,
            ChunkSize::Ms40 => 40,
        }
    }
}

/// Streaming playback settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Buffer this much audio before first emission (100-1000)
    #[serde(default = "default_min_start_ms")]
    pub min_start_ms: u32,
    /// Pause emission below this buffered depth (50-500)
    #[serde(default = "default_low_watermark_ms")]
    pub low_watermark_ms: u32,
    /// Close the playback after this much silence from the producer (500-5000)
    #[serde(default = "default_idle_cutoff_ms")]
    pub idle_cutoff_ms: u32,
    #[serde(default)]
    pub chunk_size: ChunkSize,
    /// Discard producer chunks arriving this long after stop()
    #[serde(default = "default_provider_grace_ms")]
    pub provider_grace_ms: u32,
}

fn default_min_start_ms() -> u32 {
    300
}

fn default_low_watermark_ms() -> u32 {
    200
}

fn default_idle_cutoff_ms() -> u32 {
    1200
}

fn default_provider_grace_ms() -> u32 {
    500
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_start_ms: default_min_start_ms(),
            low_watermark_ms: default_low_watermark_ms(),
            idle_cutoff_ms: default_idle_cutoff_ms(),
            chunk_size: ChunkSize::default(),
            provider_grace_ms: default_provider_grace_ms(),
        }
    }
}

impl PlaybackConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(100..=1000).contains(&self.min_start_ms) {
            return Err(ConfigError::Invalid(format!(
                "playback.min_start_ms {} outside 100-1000",
                self.min_start_ms
            )));
        }
        if !(50..=500).contains(&self.low_watermark_ms) {
            return Err(ConfigError::Invalid(format!(
                "playback.low_watermark_ms {} outside 50-500",
                self.low_watermark_ms
            )));
        }
        if !(500..=5000).contains(&self.idle_cutoff_ms) {
            return Err(ConfigError::Invalid(format!(
                "playback.idle_cutoff_ms {} outside 500-5000",
                self.idle_cutoff_ms
            )));
        }
        Ok(())
    }
}

/// Gating and barge-in settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatingConfig {
    /// Continuous speech required to trigger barge-in
    #[serde(default = "default_barge_in_min_ms")]
    pub barge_in_min_ms: u32,
    /// RMS energy (int16 units) required alongside the VAD window
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: f32,
    /// Barge-in suppression window after a trigger
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u32,
    /// Inbound drop window after playback ends, masks the echo tail
    #[serde(default = "default_post_playback_protect_ms")]
    pub post_playback_protect_ms: u32,
    /// VAD aggressiveness 0..2; level 1 is required for server-gating
    #[serde(default = "default_vad_aggressiveness")]
    pub vad_aggressiveness: u8,
}

fn default_barge_in_min_ms() -> u32 {
    250
}

fn default_energy_threshold() -> f32 {
    1500.0
}

fn default_cooldown_ms() -> u32 {
    500
}

fn default_post_playback_protect_ms() -> u32 {
    200
}

fn default_vad_aggressiveness() -> u8 {
    1
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            barge_in_min_ms: default_barge_in_min_ms(),
            energy_threshold: default_energy_threshold(),
            cooldown_ms: default_cooldown_ms(),
            post_playback_protect_ms: default_post_playback_protect_ms(),
            vad_aggressiveness: default_vad_aggressiveness(),
        }
    }
}

/// Outbound dialer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_lease_ttl_s")]
    pub lease_ttl_s: u32,
    #[serde(default = "default_sweep_interval_s")]
    pub sweep_interval_s: u32,
    /// No answer or progress within this window fails the attempt
    #[serde(default = "default_originate_timeout_s")]
    pub originate_timeout_s: u32,
    /// Dialplan context the dialer originates through (AMD hop lives there)
    #[serde(default = "default_dial_context")]
    pub dial_context: String,
}

fn default_lease_ttl_s() -> u32 {
    120
}

fn default_sweep_interval_s() -> u32 {
    30
}

fn default_originate_timeout_s() -> u32 {
    30
}

fn default_dial_context() -> String {
    "phone-agent-outbound".to_string()
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lease_ttl_s: default_lease_ttl_s(),
            sweep_interval_s: default_sweep_interval_s(),
            originate_timeout_s: default_originate_timeout_s(),
            dial_context: default_dial_context(),
        }
    }
}

/// Which variant a provider is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// One bidirectional session doing STT+LLM+TTS internally
    Monolithic,
    /// Composed STT / LLM / TTS adapters
    Pipeline,
}

/// One named provider entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub gate_policy: GatePolicy,
    /// Monolithic: websocket endpoint
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the env var holding the API key, e.g. OPENAI_API_KEY
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_handshake_timeout_s")]
    pub handshake_timeout_s: u32,
    #[serde(default = "default_keepalive_interval_s")]
    pub keepalive_interval_s: u32,
    /// Formats the provider accepts / emits; used by plan() validation
    #[serde(default)]
    pub supported_input: Vec<FormatConfig>,
    #[serde(default)]
    pub supported_output: Vec<FormatConfig>,
    /// Pipeline components
    #[serde(default)]
    pub stt: Option<HttpEndpointConfig>,
    #[serde(default)]
    pub llm: Option<HttpEndpointConfig>,
    #[serde(default)]
    pub tts: Option<HttpEndpointConfig>,
}

fn default_handshake_timeout_s() -> u32 {
    5
}

fn default_keepalive_interval_s() -> u32 {
    20
}

/// One HTTP-backed pipeline component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEndpointConfig {
    pub url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_endpoint_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_endpoint_timeout_ms() -> u64 {
    10_000
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cross-field validation; run at startup and before each hot reload.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.playback.validate()?;

        for (name, profile) in &self.profiles {
            profile.validate(name)?;
        }

        for (name, context) in &self.contexts {
            if !self.providers.contains_key(&context.provider) {
                return Err(ConfigError::Invalid(format!(
                    "context '{name}' references unknown provider '{}'",
                    context.provider
                )));
            }
            if !self.profiles.contains_key(&context.audio_profile) {
                return Err(ConfigError::UnknownProfile(context.audio_profile.clone()));
            }
            let known = |tool: &String| self.tools.iter().any(|t| &t.name == tool);
            for tool in context
                .pre_call_tools
                .iter()
                .chain(&context.in_call_tools)
                .chain(&context.post_call_tools)
            {
                if !known(tool) {
                    return Err(ConfigError::Invalid(format!(
                        "context '{name}' references unknown tool '{tool}'"
                    )));
                }
            }
        }

        if self.environment.is_production() {
            for (name, provider) in &self.providers {
                if let Some(env_var) = &provider.api_key_env {
                    if std::env::var(env_var).is_err() {
                        tracing::warn!(provider = %name, env = %env_var, "provider credential not set");
                    }
                }
            }
            if self.asterisk.ari_password.is_empty() {
                return Err(ConfigError::MissingCredential("ARI_PASSWORD".to_string()));
            }
        }

        Ok(())
    }
}

/// Load settings from files and environment.
/// Priority: env vars > config/{env}.yaml > config/default.yaml > defaults.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    let default_path = Path::new("config/default.yaml");
    if default_path.exists() {
        builder = builder.add_source(File::from(default_path));
    }

    if let Some(env_name) = env {
        let env_path_string = format!("config/{env_name}.yaml");
        let env_path = Path::new(&env_path_string);
        if env_path.exists() {
            builder = builder.add_source(File::from(env_path));
        }
    }

    let settings: Settings = builder
        .add_source(Environment::with_prefix("PHONE_AGENT").separator("__"))
        .build()?
        .try_deserialize()?;

    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn context_with_unknown_provider_is_rejected() {
        let mut settings = Settings::default();
        settings
            .contexts
            .insert("sales".to_string(), CallContextConfig::default());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn playback_ranges_are_enforced() {
        let mut settings = Settings::default();
        settings.playback.min_start_ms = 50;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn chunk_size_auto_resolves_to_20ms() {
        assert_eq!(ChunkSize::Auto.as_ms(), 20);
        assert_eq!(ChunkSize::Ms40.as_ms(), 40);
    }
}
