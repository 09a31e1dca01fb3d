//! Asterisk REST Interface client
//!
//! One shared HTTP client for commands plus a WebSocket consumer for the
//! event stream. The events channel is the engine's single source of call
//! lifecycle truth; the consumer task reconnects with backoff and the
//! receiver only closes when the client is dropped.

use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use phone_agent_config::AsteriskConfig;

use crate::TransportError;

/// Caller or connected line identity on a channel
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CallerId {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

/// Dialplan position of a channel
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DialplanLocation {
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub exten: String,
    #[serde(default)]
    pub priority: i64,
}

/// An Asterisk channel as carried on events
#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub caller: CallerId,
    #[serde(default)]
    pub dialplan: DialplanLocation,
    #[serde(default)]
    pub channelvars: Option<HashMap<String, String>>,
}

/// A playback object as carried on events
#[derive(Debug, Clone, Deserialize)]
pub struct Playback {
    pub id: String,
    #[serde(default)]
    pub media_uri: String,
    #[serde(default)]
    pub target_uri: String,
}

/// Events the engine consumes from the ARI stream
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AriEvent {
    /// Channel entered the Stasis application (new call or AMD re-entry)
    StasisStart {
        #[serde(default)]
        args: Vec<String>,
        channel: Channel,
    },
    /// Channel left the Stasis application
    StasisEnd { channel: Channel },
    ChannelDestroyed {
        channel: Channel,
        #[serde(default)]
        cause: i64,
        #[serde(default)]
        cause_txt: String,
    },
    ChannelDtmfReceived {
        channel: Channel,
        digit: String,
    },
    PlaybackFinished { playback: Playback },
    /// Anything else on the stream; ignored by the engine
    #[serde(other)]
    Unknown,
}

/// Parameters for originating an outbound channel
#[derive(Debug, Clone, Default)]
pub struct OriginateParams {
    /// Dial string, e.g. `SIP/6000` or `Local/15551234@outbound-amd`
    pub endpoint: String,
    /// Stasis app to deliver the answered channel to
    pub app: Option<String>,
    pub app_args: Option<String>,
    /// Or: continue in dialplan at this location
    pub context: Option<String>,
    pub extension: Option<String>,
    pub priority: Option<i64>,
    pub caller_id: Option<String>,
    pub timeout_s: Option<u32>,
    pub variables: HashMap<String, String>,
}

/// Shared ARI client. Cheap to clone; commands serialize on the underlying
/// HTTP connection pool.
#[derive(Clone)]
pub struct AriClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    username: String,
    password: String,
    app: String,
}

impl AriClient {
    pub fn new(config: &AsteriskConfig) -> Self {
        let base_url = format!("http://{}:{}/ari", config.host, config.ari_port);
        let ws_url = format!(
            "ws://{}:{}/ari/events?app={}&api_key={}:{}&subscribeAll=true",
            config.host, config.ari_port, config.stasis_app, config.ari_username, config.ari_password
        );
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            base_url,
            ws_url,
            username: config.ari_username.clone(),
            password: config.ari_password.clone(),
            app: config.stasis_app.clone(),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// Start consuming the event stream. The spawned task reconnects with
    /// backoff until the returned receiver is dropped.
    pub fn connect_events(&self) -> mpsc::Receiver<AriEvent> {
        let (tx, rx) = mpsc::channel(256);
        let ws_url = self.ws_url.clone();

        tokio::spawn(async move {
            let mut backoff = Duration::from_millis(500);
            loop {
                match connect_async(ws_url.as_str()).await {
                    Ok((mut stream, _)) => {
                        tracing::info!("ari event stream connected");
                        backoff = Duration::from_millis(500);
                        while let Some(message) = stream.next().await {
                            match message {
                                Ok(Message::Text(text)) => {
                                    match serde_json::from_str::<AriEvent>(&text) {
                                        Ok(AriEvent::Unknown) => {}
                                        Ok(event) => {
                                            if tx.send(event).await.is_err() {
                                                return;
                                            }
                                        }
                                        Err(e) => {
                                            tracing::debug!("unparsed ari event: {e}");
                                        }
                                    }
                                }
                                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                                Ok(Message::Close(_)) | Err(_) => break,
                                _ => {}
                            }
                        }
                        tracing::warn!("ari event stream disconnected, reconnecting");
                    }
                    Err(e) => {
                        tracing::warn!("ari connect failed: {e}, retrying in {backoff:?}");
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(10));
            }
        });

        rx
    }

    async fn post(&self, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value, TransportError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.username, Some(&self.password))
            .query(query)
            .send()
            .await
            .map_err(|e| TransportError::Http {
                status: 0,
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: format!("{path}: {body}"),
            });
        }
        Ok(response.json().await.unwrap_or(serde_json::Value::Null))
    }

    async fn delete(&self, path: &str) -> Result<(), TransportError> {
        let response = self
            .http
            .delete(format!("{}{}", self.base_url, path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| TransportError::Http {
                status: 0,
                message: e.to_string(),
            })?;
        let status = response.status();
        // 404 on delete means already gone; callers treat that as success.
        if !status.is_success() && status.as_u16() != 404 {
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: path.to_string(),
            });
        }
        Ok(())
    }

    pub async fn answer(&self, channel_id: &str) -> Result<(), TransportError> {
        self.post(&format!("/channels/{channel_id}/answer"), &[]).await?;
        Ok(())
    }

    pub async fn hangup(&self, channel_id: &str) -> Result<(), TransportError> {
        self.delete(&format!("/channels/{channel_id}")).await
    }

    pub async fn continue_in_dialplan(
        &self,
        channel_id: &str,
        context: &str,
        extension: &str,
        priority: i64,
    ) -> Result<(), TransportError> {
        self.post(
            &format!("/channels/{channel_id}/continue"),
            &[
                ("context", context.to_string()),
                ("extension", extension.to_string()),
                ("priority", priority.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn redirect(&self, channel_id: &str, endpoint: &str) -> Result<(), TransportError> {
        self.post(
            &format!("/channels/{channel_id}/redirect"),
            &[("endpoint", endpoint.to_string())],
        )
        .await?;
        Ok(())
    }

    pub async fn create_bridge(&self) -> Result<String, TransportError> {
        let body = self.post("/bridges", &[("type", "mixing".to_string())]).await?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| TransportError::Protocol("bridge create returned no id".into()))
    }

    pub async fn add_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<(), TransportError> {
        self.post(
            &format!("/bridges/{bridge_id}/addChannel"),
            &[("channel", channel_id.to_string())],
        )
        .await?;
        Ok(())
    }

    pub async fn remove_from_bridge(
        &self,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<(), TransportError> {
        self.post(
            &format!("/bridges/{bridge_id}/removeChannel"),
            &[("channel", channel_id.to_string())],
        )
        .await?;
        Ok(())
    }

    pub async fn destroy_bridge(&self, bridge_id: &str) -> Result<(), TransportError> {
        self.delete(&format!("/bridges/{bridge_id}")).await
    }

    /// Originate a channel. Returns the new channel id.
    pub async fn originate(&self, params: OriginateParams) -> Result<String, TransportError> {
        let mut query: Vec<(&str, String)> = vec![("endpoint", params.endpoint.clone())];
        if let Some(app) = &params.app {
            query.push(("app", app.clone()));
        }
        if let Some(args) = &params.app_args {
            query.push(("appArgs", args.clone()));
        }
        if let Some(context) = &params.context {
            query.push(("context", context.clone()));
        }
        if let Some(extension) = &params.extension {
            query.push(("extension", extension.clone()));
        }
        if let Some(priority) = params.priority {
            query.push(("priority", priority.to_string()));
        }
        if let Some(caller_id) = &params.caller_id {
            query.push(("callerId", caller_id.clone()));
        }
        if let Some(timeout) = params.timeout_s {
            query.push(("timeout", timeout.to_string()));
        }

        let response = self
            .http
            .post(format!("{}/channels", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .query(&query)
            .json(&json!({ "variables": params.variables }))
            .send()
            .await
            .map_err(|e| TransportError::Http {
                status: 0,
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: format!("originate: {body}"),
            });
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| TransportError::Protocol("originate returned no channel id".into()))
    }

    /// Create an external-media channel toward our media listener.
    /// `encapsulation` is `audiosocket` (tcp, `data` carries the session
    /// UUID) or `rtp` (udp). Returns the channel id actually assigned.
    pub async fn create_external_media(
        &self,
        channel_id: &str,
        external_host: &str,
        format: &str,
        encapsulation: &str,
        data: Option<&str>,
    ) -> Result<String, TransportError> {
        let mut query: Vec<(&str, String)> = vec![
            ("channelId", channel_id.to_string()),
            ("app", self.app.clone()),
            ("external_host", external_host.to_string()),
            ("format", format.to_string()),
            ("encapsulation", encapsulation.to_string()),
            (
                "transport",
                if encapsulation == "rtp" { "udp" } else { "tcp" }.to_string(),
            ),
        ];
        if let Some(data) = data {
            query.push(("data", data.to_string()));
        }
        let body = self.post("/channels/externalMedia", &query).await?;
        Ok(body
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or(channel_id)
            .to_string())
    }

    /// Start a media playback on a channel. Returns the playback id.
    pub async fn play_media(&self, channel_id: &str, media_uri: &str) -> Result<String, TransportError> {
        let body = self
            .post(
                &format!("/channels/{channel_id}/play"),
                &[("media", media_uri.to_string())],
            )
            .await?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| TransportError::Protocol("play returned no playback id".into()))
    }

    pub async fn stop_playback(&self, playback_id: &str) -> Result<(), TransportError> {
        self.delete(&format!("/playbacks/{playback_id}")).await
    }

    pub async fn set_channel_var(
        &self,
        channel_id: &str,
        variable: &str,
        value: &str,
    ) -> Result<(), TransportError> {
        self.post(
            &format!("/channels/{channel_id}/variable"),
            &[("variable", variable.to_string()), ("value", value.to_string())],
        )
        .await?;
        Ok(())
    }

    pub async fn get_channel_var(
        &self,
        channel_id: &str,
        variable: &str,
    ) -> Result<Option<String>, TransportError> {
        let response = self
            .http
            .get(format!("{}/channels/{channel_id}/variable", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("variable", variable)])
            .send()
            .await
            .map_err(|e| TransportError::Http {
                status: 0,
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(body.get("value").and_then(|v| v.as_str()).map(str::to_string))
    }

    /// Reachability probe for the health endpoint.
    pub async fn ping(&self) -> bool {
        self.http
            .get(format!("{}/asterisk/info", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stasis_start_parses_with_args() {
        let raw = r#"{
            "type": "StasisStart",
            "args": ["outbound_amd", "42", "HUMAN", "AMDTOTALANALYSISTIME-2200", "1"],
            "channel": {
                "id": "1722470400.17",
                "name": "PJSIP/alice-00000011",
                "state": "Up",
                "caller": {"name": "Alice", "number": "15551000"},
                "dialplan": {"context": "from-trunk", "exten": "100", "priority": 3}
            }
        }"#;
        let event: AriEvent = serde_json::from_str(raw).unwrap();
        match event {
            AriEvent::StasisStart { args, channel } => {
                assert_eq!(args[0], "outbound_amd");
                assert_eq!(channel.caller.number, "15551000");
                assert_eq!(channel.dialplan.exten, "100");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_tolerated() {
        let raw = r#"{"type": "ChannelVarset", "variable": "X", "value": "1"}"#;
        let event: AriEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(event, AriEvent::Unknown));
    }

    #[test]
    fn playback_finished_parses() {
        let raw = r#"{
            "type": "PlaybackFinished",
            "playback": {"id": "pb-1", "media_uri": "sound:hold", "target_uri": "channel:c1"}
        }"#;
        let event: AriEvent = serde_json::from_str(raw).unwrap();
        match event {
            AriEvent::PlaybackFinished { playback } => assert_eq!(playback.id, "pb-1"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
