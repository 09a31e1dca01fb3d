//! Dialer worker loop and origination

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use phone_agent_config::DialerConfig;
use phone_agent_persistence::{
    AmdStatus, Campaign, CampaignState, Lead, LeadState, OutboundStore,
};
use phone_agent_transport::{AriClient, OriginateParams};

use crate::amd::{decide, AmdDecision, AmdEntry};
use crate::{originate_failure_is_retryable, DialerError};

/// Outbound dialer. One per process; cheap to share.
pub struct Dialer {
    store: OutboundStore,
    ari: AriClient,
    config: DialerConfig,
    /// Per-campaign pacing clock
    last_originate: Mutex<HashMap<String, Instant>>,
    /// Originated channel -> attempt, for pre-AMD hangup classification
    active_channels: Mutex<HashMap<String, String>>,
}

impl Dialer {
    pub fn new(store: OutboundStore, ari: AriClient, config: DialerConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            ari,
            config,
            last_originate: Mutex::new(HashMap::new()),
            active_channels: Mutex::new(HashMap::new()),
        })
    }

    /// Run the scheduling loop until the process exits.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let dialer = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(1000));
            let mut sweep = tokio::time::interval(Duration::from_secs(
                dialer.config.sweep_interval_s.max(1) as u64,
            ));
            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        if let Err(e) = dialer.store.recover_expired_leases().await {
                            tracing::error!("lease recovery failed: {e}");
                        }
                    }
                    _ = tick.tick() => {
                        if let Err(e) = dialer.pump().await {
                            tracing::error!("dialer tick failed: {e}");
                        }
                    }
                }
            }
        })
    }

    /// One scheduling pass over all running campaigns.
    async fn pump(&self) -> Result<(), DialerError> {
        let campaigns = self.store.list_campaigns().await?;
        let now = chrono::Utc::now();

        for campaign in campaigns {
            if campaign.pacing_state != CampaignState::Running {
                continue;
            }
            if !campaign.window_open(now) {
                continue;
            }
            if !self.interval_elapsed(&campaign) {
                continue;
            }

            // One lead per campaign per tick; min_interval_ms paces the
            // rest. The store re-checks max_concurrent transactionally.
            let leads = self
                .store
                .lease_leads(&campaign, 1, self.config.lease_ttl_s)
                .await?;
            for lead in leads {
                self.mark_originated(&campaign);
                if let Err(e) = self.dial(&campaign, &lead).await {
                    tracing::warn!(
                        campaign = %campaign.id,
                        lead = %lead.id,
                        "originate failed: {e}"
                    );
                }
            }

            if self.store.maybe_complete_campaign(&campaign.id).await? {
                tracing::info!(campaign = %campaign.id, "campaign completed");
            }
        }
        Ok(())
    }

    fn interval_elapsed(&self, campaign: &Campaign) -> bool {
        let last = self.last_originate.lock().get(&campaign.id).copied();
        match last {
            Some(instant) => {
                instant.elapsed() >= Duration::from_millis(campaign.min_interval_ms)
            }
            None => true,
        }
    }

    fn mark_originated(&self, campaign: &Campaign) {
        self.last_originate
            .lock()
            .insert(campaign.id.clone(), Instant::now());
    }

    /// Originate one lead through the AMD dialplan hop.
    async fn dial(&self, campaign: &Campaign, lead: &Lead) -> Result<(), DialerError> {
        let attempt = self.store.create_attempt(&lead.id).await?;
        self.store.mark_lead_dialing(&lead.id).await?;

        let mut variables = HashMap::from([
            ("PA_ATTEMPT_ID".to_string(), attempt.id.clone()),
            ("PA_LEAD_ID".to_string(), lead.id.clone()),
            ("PA_CAMPAIGN_ID".to_string(), campaign.id.clone()),
            (
                "PA_CONSENT_REQUIRED".to_string(),
                if campaign.consent_required { "1" } else { "0" }.to_string(),
            ),
        ]);
        for (name, value) in &lead.custom_vars {
            variables.insert(format!("PA_VAR_{}", name.to_uppercase()), value.clone());
        }

        let params = OriginateParams {
            endpoint: format!("Local/{}@{}", lead.number, self.config.dial_context),
            context: Some(self.config.dial_context.clone()),
            extension: Some(lead.number.clone()),
            priority: Some(1),
            caller_id: campaign.caller_id.clone(),
            timeout_s: Some(self.config.originate_timeout_s),
            variables,
            ..Default::default()
        };

        match self.ari.originate(params).await {
            Ok(channel_id) => {
                self.active_channels
                    .lock()
                    .insert(channel_id.clone(), attempt.id.clone());
                metrics::counter!("outbound_originations_total").increment(1);
                tracing::info!(
                    campaign = %campaign.id,
                    lead = %lead.id,
                    attempt = %attempt.id,
                    channel = %channel_id,
                    "originated outbound call"
                );
                Ok(())
            }
            Err(e) => {
                let retryable = originate_failure_is_retryable(&e);
                self.store
                    .finish_attempt(&attempt.id, None, None, None, "originate_failed", None)
                    .await?;
                if retryable {
                    self.store.requeue_lead(&lead.id).await?;
                } else {
                    self.store.finish_lead(&lead.id, LeadState::Error).await?;
                }
                metrics::counter!("outbound_calls_total", "outcome" => "originate_failed")
                    .increment(1);
                Err(e.into())
            }
        }
    }

    /// Resolve the AMD re-entry for a channel back into a branch decision.
    /// Records consent/AMD facts on the attempt as a side effect of the
    /// terminal branches; `AttachAi` is recorded when the call ends.
    pub async fn decide_amd(&self, entry: &AmdEntry) -> Result<AmdDecision, DialerError> {
        let attempt = self.store.get_attempt(&entry.attempt_id).await?;
        let lead = self.store.get_lead(&attempt.lead_id).await?;
        let campaign = self.store.get_campaign(&lead.campaign_id).await?;
        decide(entry, campaign, lead)
    }

    /// Record the terminal outcome of one attempt and release its lead.
    pub async fn finish_attempt(
        &self,
        entry: &AmdEntry,
        outcome: &str,
        lead_terminal: bool,
        call_history_call_id: Option<String>,
    ) -> Result<(), DialerError> {
        let attempt = self.store.get_attempt(&entry.attempt_id).await?;
        self.store
            .finish_attempt(
                &entry.attempt_id,
                entry.status,
                entry.cause.clone(),
                entry.consent_digit,
                outcome,
                call_history_call_id,
            )
            .await?;

        let lead_state = if lead_terminal {
            LeadState::Completed
        } else {
            // Leave the lead recyclable (lease sweep or manual requeue).
            LeadState::Pending
        };
        match lead_state {
            LeadState::Pending => self.store.requeue_lead(&attempt.lead_id).await?,
            state => self.store.finish_lead(&attempt.lead_id, state).await?,
        }

        metrics::counter!("outbound_calls_total", "outcome" => outcome.to_string()).increment(1);
        Ok(())
    }

    /// An originated channel died. If its attempt never reached AMD,
    /// classify the hangup cause (busy / no-answer / congestion) and
    /// recycle the lead. AMD re-entry clears the mapping first, so this is
    /// a no-op for answered calls.
    pub async fn note_channel_destroyed(&self, channel_id: &str, cause: i64) {
        let attempt_id = self.active_channels.lock().remove(channel_id);
        let Some(attempt_id) = attempt_id else { return };

        match self.store.get_attempt(&attempt_id).await {
            Ok(attempt) if attempt.outcome.is_none() => {
                let outcome = crate::outcome_for_hangup_cause(cause);
                if let Err(e) = self.record_failed_attempt(&attempt_id, outcome).await {
                    tracing::error!(attempt = %attempt_id, "hangup bookkeeping failed: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(attempt = %attempt_id, "attempt lookup failed: {e}"),
        }
    }

    /// AMD re-entry reached the engine: the attempt is past the dial
    /// phase, so its originated leg must no longer be treated as a
    /// pre-AMD failure when it eventually tears down.
    pub fn forget_attempt(&self, attempt_id: &str) {
        self.active_channels
            .lock()
            .retain(|_, attempt| attempt != attempt_id);
    }

    /// Hangup-cause bookkeeping for attempts that never reached AMD.
    pub async fn record_failed_attempt(
        &self,
        attempt_id: &str,
        outcome: &str,
    ) -> Result<(), DialerError> {
        let attempt = self.store.get_attempt(attempt_id).await?;
        self.store
            .finish_attempt(attempt_id, None, None, None, outcome, None)
            .await?;
        self.store.requeue_lead(&attempt.lead_id).await?;
        metrics::counter!("outbound_calls_total", "outcome" => outcome.to_string()).increment(1);
        Ok(())
    }

    pub fn store(&self) -> &OutboundStore {
        &self.store
    }

    /// AMD verdicts that mean "a person answered".
    pub fn is_human(status: Option<AmdStatus>) -> bool {
        matches!(status, Some(AmdStatus::Human))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phone_agent_config::AsteriskConfig;
    use phone_agent_persistence::{open_test_database, NewCampaign, NewLead};

    async fn dialer() -> Arc<Dialer> {
        let pool = open_test_database().await.unwrap();
        let store = OutboundStore::new(pool);
        let ari = AriClient::new(&AsteriskConfig::default());
        Dialer::new(store, ari, DialerConfig::default())
    }

    #[tokio::test]
    async fn pacing_interval_gates_campaigns() {
        let dialer = dialer().await;
        let campaign = dialer
            .store()
            .create_campaign(NewCampaign {
                name: "x".into(),
                context_name: "default".into(),
                min_interval_ms: 60_000,
                max_concurrent: 5,
                window_start: "00:00".into(),
                window_end: "23:59".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(dialer.interval_elapsed(&campaign));
        dialer.mark_originated(&campaign);
        assert!(!dialer.interval_elapsed(&campaign));
    }

    #[tokio::test]
    async fn consent_denied_finishes_attempt_and_recycles_lead() {
        let dialer = dialer().await;
        let campaign = dialer
            .store()
            .create_campaign(NewCampaign {
                name: "x".into(),
                context_name: "default".into(),
                consent_required: true,
                max_concurrent: 1,
                window_start: "00:00".into(),
                window_end: "23:59".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        dialer
            .store()
            .set_campaign_state(&campaign.id, CampaignState::Running)
            .await
            .unwrap();
        let lead = dialer
            .store()
            .add_lead(NewLead {
                campaign_id: campaign.id.clone(),
                number: "15551234".into(),
                name: None,
                custom_vars: HashMap::new(),
            })
            .await
            .unwrap();
        let campaign = dialer.store().get_campaign(&campaign.id).await.unwrap();
        let leased = dialer.store().lease_leads(&campaign, 1, 60).await.unwrap();
        let attempt = dialer.store().create_attempt(&leased[0].id).await.unwrap();

        let entry = AmdEntry {
            attempt_id: attempt.id.clone(),
            status: Some(AmdStatus::Human),
            cause: None,
            consent_digit: Some(2),
            consent_reason: None,
        };
        let decision = dialer.decide_amd(&entry).await.unwrap();
        assert!(matches!(decision, AmdDecision::HangupConsentDenied));

        dialer
            .finish_attempt(&entry, "consent_denied", false, None)
            .await
            .unwrap();

        let loaded = dialer.store().get_attempt(&attempt.id).await.unwrap();
        assert_eq!(loaded.outcome.as_deref(), Some("consent_denied"));
        assert_eq!(loaded.consent_digit, Some(2));
        // Lead remains recyclable.
        assert_eq!(
            dialer.store().get_lead(&lead.id).await.unwrap().state,
            LeadState::Pending
        );
    }
}
