//! Live call session store
//!
//! One [`CallHandle`] per active call, keyed by call id (the PBX channel
//! id). The session itself is mutated only on the call's coordinator task;
//! other parties (tools, the ARI loop) talk to the call through its
//! command channel and read snapshots.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use phone_agent_core::CallSession;

/// Cross-task commands into a call's coordinator loop.
#[derive(Debug, Clone)]
pub enum CallCommand {
    /// PBX side hung up (media terminate or ChannelDestroyed)
    Hangup,
    /// Transfer target answered and entered the app
    TransferComplete { channel_id: String },
    /// Transfer originate failed after the tool already returned
    TransferFailed { reason: String },
    /// Hangup tool fired: speak `farewell`, hang up when it finishes
    HangupAfterFarewell { farewell: String },
    /// DTMF digit observed on the caller channel
    Digit(char),
    /// Process is shutting down; end the call gracefully
    Shutdown,
}

/// Handle to one live call.
#[derive(Clone)]
pub struct CallHandle {
    pub session: Arc<Mutex<CallSession>>,
    pub commands: mpsc::Sender<CallCommand>,
    /// Caller channel id on the PBX
    pub channel_id: String,
    /// Mixing bridge holding the caller and the media leg
    pub bridge_id: String,
    /// External media channel id (detached on transfer)
    pub media_channel_id: String,
}

impl CallHandle {
    /// Fire a command without waiting; the call may already be gone.
    pub fn send(&self, command: CallCommand) {
        if let Err(e) = self.commands.try_send(command) {
            tracing::debug!(channel = %self.channel_id, "call command dropped: {e}");
        }
    }
}

/// All live calls.
#[derive(Default)]
pub struct SessionStore {
    calls: DashMap<String, CallHandle>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    pub fn insert(&self, call_id: &str, handle: CallHandle) {
        self.calls.insert(call_id.to_string(), handle);
        metrics::gauge!("active_calls").set(self.calls.len() as f64);
    }

    pub fn remove(&self, call_id: &str) -> Option<CallHandle> {
        let removed = self.calls.remove(call_id).map(|(_, handle)| handle);
        metrics::gauge!("active_calls").set(self.calls.len() as f64);
        removed
    }

    pub fn get(&self, call_id: &str) -> Option<CallHandle> {
        self.calls.get(call_id).map(|entry| entry.clone())
    }

    /// Find the call that owns a given PBX channel (caller or media leg).
    pub fn find_by_channel(&self, channel_id: &str) -> Option<CallHandle> {
        self.calls
            .iter()
            .find(|entry| {
                entry.channel_id == channel_id || entry.media_channel_id == channel_id
            })
            .map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Broadcast a command to every live call (shutdown drain).
    pub fn broadcast(&self, command: CallCommand) {
        for entry in self.calls.iter() {
            entry.send(command.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phone_agent_core::CallDirection;

    fn handle(call_id: &str, channel: &str, media: &str) -> CallHandle {
        let (tx, _rx) = mpsc::channel(8);
        CallHandle {
            session: Arc::new(Mutex::new(CallSession::new(
                call_id,
                "100",
                "200",
                "default",
                CallDirection::Inbound,
            ))),
            commands: tx,
            channel_id: channel.to_string(),
            bridge_id: "b1".to_string(),
            media_channel_id: media.to_string(),
        }
    }

    #[test]
    fn lookup_by_either_channel() {
        let store = SessionStore::new();
        store.insert("c1", handle("c1", "chan-a", "chan-media"));

        assert!(store.find_by_channel("chan-a").is_some());
        assert!(store.find_by_channel("chan-media").is_some());
        assert!(store.find_by_channel("other").is_none());
        assert_eq!(store.len(), 1);

        store.remove("c1");
        assert!(store.is_empty());
    }
}
