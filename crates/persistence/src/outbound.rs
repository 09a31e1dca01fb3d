//! Outbound campaign tables: campaigns, leads, attempts
//!
//! Invariants enforced here:
//! - at most one attempt per lead is in `{leased, dialing}` at any moment
//!   (lead state machine; attempts append-only)
//! - leases carry a TTL and are recycled idempotently by the sweep
//! - leasing is a `BEGIN IMMEDIATE` select-then-update transaction that
//!   re-checks the concurrency cap inside the transaction

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use crate::PersistenceError;

/// Campaign pacing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignState {
    Draft,
    Running,
    Paused,
    Completed,
}

impl CampaignState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignState::Draft => "draft",
            CampaignState::Running => "running",
            CampaignState::Paused => "paused",
            CampaignState::Completed => "completed",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "running" => CampaignState::Running,
            "paused" => CampaignState::Paused,
            "completed" => CampaignState::Completed,
            _ => CampaignState::Draft,
        }
    }
}

/// Lead lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadState {
    Pending,
    Leased,
    Dialing,
    Completed,
    Canceled,
    Error,
}

impl LeadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadState::Pending => "pending",
            LeadState::Leased => "leased",
            LeadState::Dialing => "dialing",
            LeadState::Completed => "completed",
            LeadState::Canceled => "canceled",
            LeadState::Error => "error",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "leased" => LeadState::Leased,
            "dialing" => LeadState::Dialing,
            "completed" => LeadState::Completed,
            "canceled" => LeadState::Canceled,
            "error" => LeadState::Error,
            _ => LeadState::Pending,
        }
    }
}

/// Answering-machine-detection verdict from the PBX
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmdStatus {
    Human,
    Machine,
    NotSure,
}

impl AmdStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AmdStatus::Human => "HUMAN",
            AmdStatus::Machine => "MACHINE",
            AmdStatus::NotSure => "NOTSURE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "HUMAN" => Some(AmdStatus::Human),
            "MACHINE" => Some(AmdStatus::Machine),
            "NOTSURE" => Some(AmdStatus::NotSure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub context_name: String,
    /// "UTC" or a fixed offset like "+05:30" / "-08:00"
    pub timezone: String,
    /// Local wall-clock window, "HH:MM"
    pub window_start: String,
    pub window_end: String,
    pub max_concurrent: u32,
    pub min_interval_ms: u64,
    pub pacing_state: CampaignState,
    pub consent_required: bool,
    pub voicemail_drop_enabled: bool,
    pub voicemail_media_uri: Option<String>,
    pub caller_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    fn utc_offset_minutes(&self) -> i32 {
        let tz = self.timezone.trim();
        if tz.eq_ignore_ascii_case("utc") || tz.is_empty() {
            return 0;
        }
        let (sign, rest) = match tz.split_at(1) {
            ("+", rest) => (1, rest),
            ("-", rest) => (-1, rest),
            _ => return 0,
        };
        let mut parts = rest.split(':');
        let hours: i32 = parts.next().and_then(|h| h.parse().ok()).unwrap_or(0);
        let minutes: i32 = parts.next().and_then(|m| m.parse().ok()).unwrap_or(0);
        sign * (hours * 60 + minutes)
    }

    /// Whether the campaign's dialing window is open at `now`.
    /// Windows may wrap midnight (start > end).
    pub fn window_open(&self, now: DateTime<Utc>) -> bool {
        let local = now + chrono::Duration::minutes(self.utc_offset_minutes() as i64);
        let time = local.time();
        let start = parse_hhmm(&self.window_start).unwrap_or(NaiveTime::MIN);
        let end = parse_hhmm(&self.window_end)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(23, 59, 59).unwrap());
        if start <= end {
            time >= start && time <= end
        } else {
            time >= start || time <= end
        }
    }
}

fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M").ok()
}

#[derive(Debug, Clone, Default)]
pub struct NewCampaign {
    pub name: String,
    pub context_name: String,
    pub timezone: String,
    pub window_start: String,
    pub window_end: String,
    pub max_concurrent: u32,
    pub min_interval_ms: u64,
    pub consent_required: bool,
    pub voicemail_drop_enabled: bool,
    pub voicemail_media_uri: Option<String>,
    pub caller_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub campaign_id: String,
    pub number: String,
    pub name: Option<String>,
    pub custom_vars: HashMap<String, String>,
    pub state: LeadState,
    pub leased_until: Option<DateTime<Utc>>,
    pub attempt_count: u32,
}

#[derive(Debug, Clone)]
pub struct NewLead {
    pub campaign_id: String,
    pub number: String,
    pub name: Option<String>,
    pub custom_vars: HashMap<String, String>,
}

/// Append-only dial attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: String,
    pub lead_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub amd_status: Option<AmdStatus>,
    pub amd_cause: Option<String>,
    pub consent_digit: Option<u8>,
    pub outcome: Option<String>,
    pub call_history_call_id: Option<String>,
}

#[derive(Clone)]
pub struct OutboundStore {
    pool: SqlitePool,
}

impl OutboundStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_campaign(&self, new: NewCampaign) -> Result<Campaign, PersistenceError> {
        let campaign = Campaign {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            context_name: new.context_name,
            timezone: if new.timezone.is_empty() { "UTC".into() } else { new.timezone },
            window_start: if new.window_start.is_empty() { "09:00".into() } else { new.window_start },
            window_end: if new.window_end.is_empty() { "20:00".into() } else { new.window_end },
            max_concurrent: new.max_concurrent.max(1),
            min_interval_ms: new.min_interval_ms,
            pacing_state: CampaignState::Draft,
            consent_required: new.consent_required,
            voicemail_drop_enabled: new.voicemail_drop_enabled,
            voicemail_media_uri: new.voicemail_media_uri,
            caller_id: new.caller_id,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO outbound_campaigns
                (id, name, context_name, timezone, window_start, window_end,
                 max_concurrent, min_interval_ms, pacing_state, consent_required,
                 voicemail_drop_enabled, voicemail_media_uri, caller_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&campaign.id)
        .bind(&campaign.name)
        .bind(&campaign.context_name)
        .bind(&campaign.timezone)
        .bind(&campaign.window_start)
        .bind(&campaign.window_end)
        .bind(campaign.max_concurrent as i64)
        .bind(campaign.min_interval_ms as i64)
        .bind(campaign.pacing_state.as_str())
        .bind(campaign.consent_required as i64)
        .bind(campaign.voicemail_drop_enabled as i64)
        .bind(&campaign.voicemail_media_uri)
        .bind(&campaign.caller_id)
        .bind(campaign.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(campaign)
    }

    pub async fn get_campaign(&self, id: &str) -> Result<Campaign, PersistenceError> {
        let row = sqlx::query("SELECT * FROM outbound_campaigns WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(format!("campaign {id}")))?;
        Ok(map_campaign(&row))
    }

    pub async fn list_campaigns(&self) -> Result<Vec<Campaign>, PersistenceError> {
        let rows = sqlx::query("SELECT * FROM outbound_campaigns ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(map_campaign).collect())
    }

    pub async fn set_campaign_state(
        &self,
        id: &str,
        state: CampaignState,
    ) -> Result<(), PersistenceError> {
        let result = sqlx::query("UPDATE outbound_campaigns SET pacing_state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(format!("campaign {id}")));
        }
        tracing::info!(campaign = %id, state = state.as_str(), "campaign state changed");
        Ok(())
    }

    pub async fn add_lead(&self, new: NewLead) -> Result<Lead, PersistenceError> {
        let lead = Lead {
            id: Uuid::new_v4().to_string(),
            campaign_id: new.campaign_id,
            number: new.number,
            name: new.name,
            custom_vars: new.custom_vars,
            state: LeadState::Pending,
            leased_until: None,
            attempt_count: 0,
        };
        sqlx::query(
            r#"
            INSERT INTO outbound_leads
                (id, campaign_id, number, name, custom_vars, state, attempt_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&lead.id)
        .bind(&lead.campaign_id)
        .bind(&lead.number)
        .bind(&lead.name)
        .bind(serde_json::to_string(&lead.custom_vars)?)
        .bind(lead.state.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(lead)
    }

    pub async fn get_lead(&self, id: &str) -> Result<Lead, PersistenceError> {
        let row = sqlx::query("SELECT * FROM outbound_leads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(format!("lead {id}")))?;
        map_lead(&row)
    }

    /// Leads currently leased or dialing for a campaign.
    pub async fn in_flight_count(&self, campaign_id: &str) -> Result<u32, PersistenceError> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM outbound_leads \
             WHERE campaign_id = ? AND state IN ('leased', 'dialing')",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?
        .get("n");
        Ok(count as u32)
    }

    pub async fn pending_count(&self, campaign_id: &str) -> Result<u32, PersistenceError> {
        let count: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM outbound_leads WHERE campaign_id = ? AND state = 'pending'")
                .bind(campaign_id)
                .fetch_one(&self.pool)
                .await?
                .get("n");
        Ok(count as u32)
    }

    /// Atomically lease up to `limit` pending leads.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front; the concurrency cap
    /// is re-checked inside the transaction so two workers cannot
    /// collectively exceed `max_concurrent`.
    pub async fn lease_leads(
        &self,
        campaign: &Campaign,
        limit: u32,
        lease_ttl_s: u32,
    ) -> Result<Vec<Lead>, PersistenceError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<Vec<Lead>, PersistenceError> = async {
            let in_flight: i64 = sqlx::query(
                "SELECT COUNT(*) AS n FROM outbound_leads \
                 WHERE campaign_id = ? AND state IN ('leased', 'dialing')",
            )
            .bind(&campaign.id)
            .fetch_one(&mut *conn)
            .await?
            .get("n");

            let available = (campaign.max_concurrent as i64 - in_flight).max(0) as u32;
            let take = limit.min(available);
            if take == 0 {
                return Ok(Vec::new());
            }

            let rows = sqlx::query(
                "SELECT * FROM outbound_leads \
                 WHERE campaign_id = ? AND state = 'pending' \
                 ORDER BY created_at LIMIT ?",
            )
            .bind(&campaign.id)
            .bind(take as i64)
            .fetch_all(&mut *conn)
            .await?;

            let leased_until = Utc::now() + chrono::Duration::seconds(lease_ttl_s as i64);
            let mut leads = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut lead = map_lead(row)?;
                sqlx::query(
                    "UPDATE outbound_leads SET state = 'leased', leased_until = ? WHERE id = ?",
                )
                .bind(leased_until.to_rfc3339())
                .bind(&lead.id)
                .execute(&mut *conn)
                .await?;
                lead.state = LeadState::Leased;
                lead.leased_until = Some(leased_until);
                leads.push(lead);
            }
            Ok(leads)
        }
        .await;

        match &result {
            Ok(_) => sqlx::query("COMMIT").execute(&mut *conn).await?,
            Err(_) => sqlx::query("ROLLBACK").execute(&mut *conn).await?,
        };
        result
    }

    pub async fn mark_lead_dialing(&self, lead_id: &str) -> Result<(), PersistenceError> {
        let result =
            sqlx::query("UPDATE outbound_leads SET state = 'dialing' WHERE id = ? AND state = 'leased'")
                .bind(lead_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::InvalidState(format!(
                "lead {lead_id} is not leased"
            )));
        }
        Ok(())
    }

    /// Terminal lead transition; clears the lease.
    pub async fn finish_lead(&self, lead_id: &str, state: LeadState) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE outbound_leads SET state = ?, leased_until = NULL WHERE id = ?")
            .bind(state.as_str())
            .bind(lead_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Return an expired-lease lead to the queue (also used on originate
    /// failure for retryable causes).
    pub async fn requeue_lead(&self, lead_id: &str) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE outbound_leads SET state = 'pending', leased_until = NULL \
             WHERE id = ? AND state IN ('leased', 'dialing')",
        )
        .bind(lead_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recycle every lead whose lease expired. Idempotent.
    pub async fn recover_expired_leases(&self) -> Result<u64, PersistenceError> {
        let result = sqlx::query(
            "UPDATE outbound_leads SET state = 'pending', leased_until = NULL \
             WHERE state IN ('leased', 'dialing') AND leased_until < ?",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            tracing::warn!(recovered = result.rows_affected(), "recycled expired leases");
        }
        Ok(result.rows_affected())
    }

    /// `running -> completed` once the queue is drained and nothing is in
    /// flight. Returns true when the transition happened.
    pub async fn maybe_complete_campaign(&self, campaign_id: &str) -> Result<bool, PersistenceError> {
        let result = sqlx::query(
            "UPDATE outbound_campaigns SET pacing_state = 'completed' \
             WHERE id = ? AND pacing_state = 'running' \
             AND NOT EXISTS (SELECT 1 FROM outbound_leads \
                 WHERE campaign_id = ? AND state IN ('pending', 'leased', 'dialing'))",
        )
        .bind(campaign_id)
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn create_attempt(&self, lead_id: &str) -> Result<Attempt, PersistenceError> {
        let attempt = Attempt {
            id: Uuid::new_v4().to_string(),
            lead_id: lead_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            amd_status: None,
            amd_cause: None,
            consent_digit: None,
            outcome: None,
            call_history_call_id: None,
        };
        sqlx::query("INSERT INTO outbound_attempts (id, lead_id, started_at) VALUES (?, ?, ?)")
            .bind(&attempt.id)
            .bind(&attempt.lead_id)
            .bind(attempt.started_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE outbound_leads SET attempt_count = attempt_count + 1 WHERE id = ?")
            .bind(lead_id)
            .execute(&self.pool)
            .await?;
        Ok(attempt)
    }

    pub async fn get_attempt(&self, id: &str) -> Result<Attempt, PersistenceError> {
        let row = sqlx::query("SELECT * FROM outbound_attempts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(format!("attempt {id}")))?;
        Ok(map_attempt(&row))
    }

    /// Record the attempt result. Append-only otherwise; this is the one
    /// mutation an attempt row receives.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_attempt(
        &self,
        attempt_id: &str,
        amd_status: Option<AmdStatus>,
        amd_cause: Option<String>,
        consent_digit: Option<u8>,
        outcome: &str,
        call_history_call_id: Option<String>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE outbound_attempts SET ended_at = ?, amd_status = ?, amd_cause = ?, \
             consent_digit = ?, outcome = ?, call_history_call_id = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(amd_status.map(|s| s.as_str()))
        .bind(amd_cause)
        .bind(consent_digit.map(|d| d as i64))
        .bind(outcome)
        .bind(call_history_call_id)
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn map_campaign(row: &sqlx::sqlite::SqliteRow) -> Campaign {
    Campaign {
        id: row.get("id"),
        name: row.get("name"),
        context_name: row.get("context_name"),
        timezone: row.get("timezone"),
        window_start: row.get("window_start"),
        window_end: row.get("window_end"),
        max_concurrent: row.get::<i64, _>("max_concurrent") as u32,
        min_interval_ms: row.get::<i64, _>("min_interval_ms") as u64,
        pacing_state: CampaignState::parse(row.get::<String, _>("pacing_state").as_str()),
        consent_required: row.get::<i64, _>("consent_required") != 0,
        voicemail_drop_enabled: row.get::<i64, _>("voicemail_drop_enabled") != 0,
        voicemail_media_uri: row.get("voicemail_media_uri"),
        caller_id: row.get("caller_id"),
        created_at: parse_time(row.get::<String, _>("created_at").as_str()),
    }
}

fn map_lead(row: &sqlx::sqlite::SqliteRow) -> Result<Lead, PersistenceError> {
    Ok(Lead {
        id: row.get("id"),
        campaign_id: row.get("campaign_id"),
        number: row.get("number"),
        name: row.get("name"),
        custom_vars: serde_json::from_str(row.get::<String, _>("custom_vars").as_str())?,
        state: LeadState::parse(row.get::<String, _>("state").as_str()),
        leased_until: row
            .get::<Option<String>, _>("leased_until")
            .map(|raw| parse_time(&raw)),
        attempt_count: row.get::<i64, _>("attempt_count") as u32,
    })
}

fn map_attempt(row: &sqlx::sqlite::SqliteRow) -> Attempt {
    Attempt {
        id: row.get("id"),
        lead_id: row.get("lead_id"),
        started_at: parse_time(row.get::<String, _>("started_at").as_str()),
        ended_at: row
            .get::<Option<String>, _>("ended_at")
            .map(|raw| parse_time(&raw)),
        amd_status: row
            .get::<Option<String>, _>("amd_status")
            .and_then(|raw| AmdStatus::parse(&raw)),
        amd_cause: row.get("amd_cause"),
        consent_digit: row.get::<Option<i64>, _>("consent_digit").map(|d| d as u8),
        outcome: row.get("outcome"),
        call_history_call_id: row.get("call_history_call_id"),
    }
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::open_test_database;

    async fn store() -> OutboundStore {
        OutboundStore::new(open_test_database().await.unwrap())
    }

    async fn campaign_with_leads(store: &OutboundStore, max_concurrent: u32, leads: u32) -> Campaign {
        let campaign = store
            .create_campaign(NewCampaign {
                name: "spring".into(),
                context_name: "default".into(),
                max_concurrent,
                min_interval_ms: 0,
                window_start: "00:00".into(),
                window_end: "23:59".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        for i in 0..leads {
            store
                .add_lead(NewLead {
                    campaign_id: campaign.id.clone(),
                    number: format!("1555000{i:04}"),
                    name: None,
                    custom_vars: HashMap::new(),
                })
                .await
                .unwrap();
        }
        store
            .set_campaign_state(&campaign.id, CampaignState::Running)
            .await
            .unwrap();
        store.get_campaign(&campaign.id).await.unwrap()
    }

    #[tokio::test]
    async fn lease_respects_max_concurrent() {
        let store = store().await;
        let campaign = campaign_with_leads(&store, 3, 10).await;

        let first = store.lease_leads(&campaign, 10, 60).await.unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|l| l.state == LeadState::Leased));

        // Cap already full: nothing more leases.
        let second = store.lease_leads(&campaign, 10, 60).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(store.in_flight_count(&campaign.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn finishing_leads_frees_capacity() {
        let store = store().await;
        let campaign = campaign_with_leads(&store, 2, 4).await;

        let leased = store.lease_leads(&campaign, 10, 60).await.unwrap();
        assert_eq!(leased.len(), 2);
        store
            .finish_lead(&leased[0].id, LeadState::Completed)
            .await
            .unwrap();

        let more = store.lease_leads(&campaign, 10, 60).await.unwrap();
        assert_eq!(more.len(), 1);
    }

    #[tokio::test]
    async fn expired_leases_are_recycled_idempotently() {
        let store = store().await;
        let campaign = campaign_with_leads(&store, 5, 2).await;

        // TTL of zero: leases are already expired.
        let leased = store.lease_leads(&campaign, 10, 0).await.unwrap();
        assert_eq!(leased.len(), 2);

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(store.recover_expired_leases().await.unwrap(), 2);
        assert_eq!(store.recover_expired_leases().await.unwrap(), 0);
        assert_eq!(store.pending_count(&campaign.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn attempts_record_amd_and_consent() {
        let store = store().await;
        let campaign = campaign_with_leads(&store, 1, 1).await;
        let lead = &store.lease_leads(&campaign, 1, 60).await.unwrap()[0];

        let attempt = store.create_attempt(&lead.id).await.unwrap();
        store
            .finish_attempt(
                &attempt.id,
                Some(AmdStatus::Human),
                Some("AMDTOTALANALYSISTIME-2100".into()),
                Some(2),
                "consent_denied",
                None,
            )
            .await
            .unwrap();

        let loaded = store.get_attempt(&attempt.id).await.unwrap();
        assert_eq!(loaded.amd_status, Some(AmdStatus::Human));
        assert_eq!(loaded.consent_digit, Some(2));
        assert_eq!(loaded.outcome.as_deref(), Some("consent_denied"));
        assert_eq!(store.get_lead(&lead.id).await.unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn campaign_completes_only_when_drained() {
        let store = store().await;
        let campaign = campaign_with_leads(&store, 2, 1).await;

        assert!(!store.maybe_complete_campaign(&campaign.id).await.unwrap());
        let leased = store.lease_leads(&campaign, 1, 60).await.unwrap();
        store
            .finish_lead(&leased[0].id, LeadState::Completed)
            .await
            .unwrap();
        assert!(store.maybe_complete_campaign(&campaign.id).await.unwrap());
        assert_eq!(
            store.get_campaign(&campaign.id).await.unwrap().pacing_state,
            CampaignState::Completed
        );
    }

    #[test]
    fn window_wraps_midnight() {
        let campaign = Campaign {
            id: "c".into(),
            name: "n".into(),
            context_name: "default".into(),
            timezone: "UTC".into(),
            window_start: "20:00".into(),
            window_end: "08:00".into(),
            max_concurrent: 1,
            min_interval_ms: 0,
            pacing_state: CampaignState::Running,
            consent_required: false,
            voicemail_drop_enabled: false,
            voicemail_media_uri: None,
            caller_id: None,
            created_at: Utc::now(),
        };
        let evening = Utc::now().date_naive().and_hms_opt(22, 0, 0).unwrap().and_utc();
        let noon = Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc();
        assert!(campaign.window_open(evening));
        assert!(!campaign.window_open(noon));
    }

    #[test]
    fn timezone_offset_shifts_window() {
        let campaign = Campaign {
            id: "c".into(),
            name: "n".into(),
            context_name: "default".into(),
            timezone: "+05:30".into(),
            window_start: "09:00".into(),
            window_end: "17:00".into(),
            max_concurrent: 1,
            min_interval_ms: 0,
            pacing_state: CampaignState::Running,
            consent_required: false,
            voicemail_drop_enabled: false,
            voicemail_media_uri: None,
            caller_id: None,
            created_at: Utc::now(),
        };
        // 04:00 UTC is 09:30 local: open. 14:00 UTC is 19:30 local: closed.
        let open = Utc::now().date_naive().and_hms_opt(4, 0, 0).unwrap().and_utc();
        let closed = Utc::now().date_naive().and_hms_opt(14, 0, 0).unwrap().and_utc();
        assert!(campaign.window_open(open));
        assert!(!campaign.window_open(closed));
    }
}
