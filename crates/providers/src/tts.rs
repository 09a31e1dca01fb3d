//! HTTP text-to-speech adapter
//!
//! Posts text and streams the chunked binary response straight through as
//! provider-output-format audio. Chunks flow into the playback manager as
//! they arrive, so time-to-first-audio tracks the service's own streaming.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use phone_agent_config::HttpEndpointConfig;
use phone_agent_core::{ProviderError, TextToSpeech};

/// Streaming HTTP TTS backend.
pub struct HttpTts {
    config: HttpEndpointConfig,
    client: reqwest::Client,
}

impl HttpTts {
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

#[async_trait]
impl TextToSpeech for HttpTts {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
    ) -> Result<mpsc::Receiver<Bytes>, ProviderError> {
        let mut request = self.client.post(&self.config.url).json(&json!({
            "text": text,
            "voice": voice,
            "model": self.config.model,
        }));
        if let Some(key) = self.api_key() {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Request(format!("tts request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Request(format!("tts returned {status}: {body}")));
        }

        let (tx, rx) = mpsc::channel(64);
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if tx.send(bytes).await.is_err() {
                            return; // playback stopped; drop the rest
                        }
                    }
                    Err(e) => {
                        tracing::warn!("tts stream ended early: {e}");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
