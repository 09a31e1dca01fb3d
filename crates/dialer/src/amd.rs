//! AMD re-entry parsing and branch decisions

use phone_agent_persistence::{AmdStatus, Campaign, Lead};

use crate::DialerError;

/// Parsed Stasis re-entry arguments from the AMD dialplan hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmdEntry {
    pub attempt_id: String,
    pub status: Option<AmdStatus>,
    pub cause: Option<String>,
    pub consent_digit: Option<u8>,
    pub consent_reason: Option<String>,
}

impl AmdEntry {
    /// Recognize `(outbound_amd, attempt_id, status, cause, consent_digit?,
    /// consent_reason?)`. Returns None for anything else (a normal inbound
    /// StasisStart, for instance).
    pub fn parse(args: &[String]) -> Option<Self> {
        if args.first().map(String::as_str) != Some("outbound_amd") {
            return None;
        }
        let attempt_id = args.get(1)?.clone();
        Some(Self {
            attempt_id,
            status: args.get(2).and_then(|s| AmdStatus::parse(s)),
            cause: args.get(3).filter(|c| !c.is_empty()).cloned(),
            consent_digit: args.get(4).and_then(|d| d.parse().ok()),
            consent_reason: args.get(5).filter(|r| !r.is_empty()).cloned(),
        })
    }
}

/// What the engine should do with an AMD-classified outbound channel.
#[derive(Debug, Clone)]
pub enum AmdDecision {
    /// Human answered (and consented, where required): attach the AI.
    AttachAi {
        campaign: Campaign,
        lead: Lead,
        consent_digit: Option<u8>,
    },
    /// Human pressed the decline digit.
    HangupConsentDenied,
    /// Consent prompt timed out without a digit.
    HangupConsentTimeout,
    /// Machine (or unsure) with a voicemail drop configured.
    VoicemailDrop { media_uri: String },
    /// Machine (or unsure), no voicemail configured.
    HangupMachine,
}

pub(crate) fn decide(entry: &AmdEntry, campaign: Campaign, lead: Lead) -> Result<AmdDecision, DialerError> {
    match entry.status {
        Some(AmdStatus::Human) => {
            if !campaign.consent_required {
                return Ok(AmdDecision::AttachAi {
                    campaign,
                    lead,
                    consent_digit: None,
                });
            }
            match entry.consent_digit {
                Some(1) => Ok(AmdDecision::AttachAi {
                    campaign,
                    lead,
                    consent_digit: Some(1),
                }),
                Some(2) => Ok(AmdDecision::HangupConsentDenied),
                Some(other) => {
                    tracing::debug!(digit = other, "unexpected consent digit, treating as denied");
                    Ok(AmdDecision::HangupConsentDenied)
                }
                None => Ok(AmdDecision::HangupConsentTimeout),
            }
        }
        Some(AmdStatus::Machine) | Some(AmdStatus::NotSure) | None => {
            if campaign.voicemail_drop_enabled {
                if let Some(media_uri) = campaign.voicemail_media_uri.clone() {
                    return Ok(AmdDecision::VoicemailDrop { media_uri });
                }
                tracing::warn!(
                    campaign = %campaign.id,
                    "voicemail drop enabled but no media configured, hanging up"
                );
            }
            Ok(AmdDecision::HangupMachine)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use phone_agent_persistence::{CampaignState, LeadState};
    use std::collections::HashMap;

    fn campaign(consent: bool, voicemail: Option<&str>) -> Campaign {
        Campaign {
            id: "camp1".into(),
            name: "spring".into(),
            context_name: "outbound_sales".into(),
            timezone: "UTC".into(),
            window_start: "00:00".into(),
            window_end: "23:59".into(),
            max_concurrent: 2,
            min_interval_ms: 0,
            pacing_state: CampaignState::Running,
            consent_required: consent,
            voicemail_drop_enabled: voicemail.is_some(),
            voicemail_media_uri: voicemail.map(str::to_string),
            caller_id: None,
            created_at: Utc::now(),
        }
    }

    fn lead() -> Lead {
        Lead {
            id: "lead1".into(),
            campaign_id: "camp1".into(),
            number: "15551234".into(),
            name: None,
            custom_vars: HashMap::new(),
            state: LeadState::Dialing,
            leased_until: None,
            attempt_count: 1,
        }
    }

    fn entry(status: &str, digit: Option<&str>) -> AmdEntry {
        let mut args = vec![
            "outbound_amd".to_string(),
            "att1".to_string(),
            status.to_string(),
            "AMDTOTALANALYSISTIME-2100".to_string(),
        ];
        if let Some(digit) = digit {
            args.push(digit.to_string());
        }
        AmdEntry::parse(&args).unwrap()
    }

    #[test]
    fn non_amd_args_are_ignored() {
        assert!(AmdEntry::parse(&[]).is_none());
        assert!(AmdEntry::parse(&["inbound".to_string()]).is_none());
    }

    #[test]
    fn human_without_consent_requirement_attaches() {
        let decision = decide(&entry("HUMAN", None), campaign(false, None), lead()).unwrap();
        assert!(matches!(decision, AmdDecision::AttachAi { consent_digit: None, .. }));
    }

    #[test]
    fn consent_digit_one_attaches_and_is_recorded() {
        let decision = decide(&entry("HUMAN", Some("1")), campaign(true, None), lead()).unwrap();
        match decision {
            AmdDecision::AttachAi { consent_digit, .. } => assert_eq!(consent_digit, Some(1)),
            other => panic!("expected attach, got {other:?}"),
        }
    }

    #[test]
    fn consent_digit_two_is_denied() {
        let decision = decide(&entry("HUMAN", Some("2")), campaign(true, None), lead()).unwrap();
        assert!(matches!(decision, AmdDecision::HangupConsentDenied));
    }

    #[test]
    fn consent_timeout_without_digit() {
        let decision = decide(&entry("HUMAN", None), campaign(true, None), lead()).unwrap();
        assert!(matches!(decision, AmdDecision::HangupConsentTimeout));
    }

    #[test]
    fn machine_branches_on_voicemail_config() {
        let decision = decide(
            &entry("MACHINE", None),
            campaign(false, Some("sound:vm-drop")),
            lead(),
        )
        .unwrap();
        assert!(matches!(decision, AmdDecision::VoicemailDrop { .. }));

        let decision = decide(&entry("MACHINE", None), campaign(false, None), lead()).unwrap();
        assert!(matches!(decision, AmdDecision::HangupMachine));

        // NOTSURE takes the machine path.
        let decision = decide(&entry("NOTSURE", None), campaign(false, None), lead()).unwrap();
        assert!(matches!(decision, AmdDecision::HangupMachine));
    }
}
