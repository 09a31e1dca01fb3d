//! HTTP speech-to-text adapter
//!
//! Posts one utterance of audio to an HTTP STT service and returns the
//! final transcript. Pipeline providers buffer an utterance (VAD-delimited)
//! before calling this, so a request/response shape is sufficient.

use async_trait::async_trait;
use serde::Deserialize;

use phone_agent_config::HttpEndpointConfig;
use phone_agent_core::{AudioFormat, ProviderError, SpeechToText, Transcript};

#[derive(Debug, Deserialize)]
struct SttResponse {
    text: String,
    #[serde(default)]
    error: Option<String>,
}

/// Whisper-style HTTP STT backend.
pub struct HttpStt {
    config: HttpEndpointConfig,
    client: reqwest::Client,
}

impl HttpStt {
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
impl SpeechToText for HttpStt {
    async fn transcribe(
        &self,
        audio: &[u8],
        format: AudioFormat,
        hints: &[String],
    ) -> Result<Transcript, ProviderError> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("content-type", "application/octet-stream")
            .query(&[
                ("encoding", format.encoding.to_string()),
                ("sample_rate", format.sample_rate_hz.to_string()),
            ]);
        if let Some(model) = &self.config.model {
            request = request.query(&[("model", model.clone())]);
        }
        if !hints.is_empty() {
            request = request.query(&[("hints", hints.join(","))]);
        }
        if let Some(key) = self.api_key() {
            request = request.bearer_auth(key);
        }

        let response = request
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| ProviderError::Request(format!("stt request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Request(format!("stt returned {status}: {body}")));
        }

        let parsed: SttResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("stt response: {e}")))?;
        if let Some(error) = parsed.error {
            return Err(ProviderError::Request(format!("stt error: {error}")));
        }

        Ok(Transcript {
            text: parsed.text,
            is_final: true,
        })
    }
}
