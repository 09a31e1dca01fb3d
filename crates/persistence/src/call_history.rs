//! Append-only call history
//!
//! One row per completed call. Two read paths: a summary projection that
//! leaves the conversation and tool-call blobs on disk, and a full detail
//! fetch by id. A retention sweep deletes rows older than the configured
//! horizon when one is set.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use phone_agent_core::{CallDirection, CallOutcome, CallRecord};

use crate::PersistenceError;

/// Summary projection for list views; omits the JSON blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecordSummary {
    pub id: String,
    pub call_id: String,
    pub caller_number: String,
    pub called_number: String,
    pub context_name: String,
    pub direction: CallDirection,
    pub start_time: DateTime<Utc>,
    pub duration_seconds: u64,
    pub provider_name: String,
    pub outcome: CallOutcome,
    pub total_turns: u32,
    pub avg_turn_latency_ms: f64,
    pub barge_in_count: u32,
    pub error_message: Option<String>,
}

/// List filters; all optional, combined with AND.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub caller_number: Option<String>,
    pub outcome: Option<CallOutcome>,
    pub provider_name: Option<String>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// One page of summaries plus the unpaginated total.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub records: Vec<CallRecordSummary>,
    pub total: u64,
}

#[derive(Clone)]
pub struct CallHistoryStore {
    pool: SqlitePool,
}

impl CallHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one record. Records are immutable once written.
    pub async fn insert(&self, record: &CallRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO call_history
                (id, call_id, caller_number, called_number, context_name, direction,
                 start_time, end_time, duration_seconds, provider_name,
                 pipeline_components, conversation_history, tool_calls, pre_call_results,
                 outcome, transfer_destination, error_message,
                 avg_turn_latency_ms, max_turn_latency_ms, total_turns, barge_in_count,
                 caller_audio_format)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.call_id)
        .bind(&record.caller_number)
        .bind(&record.called_number)
        .bind(&record.context_name)
        .bind(record.direction.to_string())
        .bind(record.start_time.to_rfc3339())
        .bind(record.end_time.to_rfc3339())
        .bind(record.duration_seconds as i64)
        .bind(&record.provider_name)
        .bind(serde_json::to_string(&record.pipeline_components)?)
        .bind(serde_json::to_string(&record.conversation_history)?)
        .bind(serde_json::to_string(&record.tool_calls)?)
        .bind(serde_json::to_string(&record.pre_call_results)?)
        .bind(record.outcome.as_str())
        .bind(&record.transfer_destination)
        .bind(&record.error_message)
        .bind(record.avg_turn_latency_ms)
        .bind(record.max_turn_latency_ms as i64)
        .bind(record.total_turns as i64)
        .bind(record.barge_in_count as i64)
        .bind(&record.caller_audio_format)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Summary list, newest first.
    pub async fn list(&self, filter: &HistoryFilter) -> Result<HistoryPage, PersistenceError> {
        let mut where_clauses: Vec<&str> = Vec::new();
        if filter.caller_number.is_some() {
            where_clauses.push("caller_number = ?");
        }
        if filter.outcome.is_some() {
            where_clauses.push("outcome = ?");
        }
        if filter.provider_name.is_some() {
            where_clauses.push("provider_name = ?");
        }
        if filter.started_after.is_some() {
            where_clauses.push("start_time >= ?");
        }
        if filter.started_before.is_some() {
            where_clauses.push("start_time <= ?");
        }
        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) AS n FROM call_history {where_sql}");
        let total: i64 = bind_filters(filter, sqlx::query(&count_sql))
            .fetch_one(&self.pool)
            .await?
            .get("n");

        let list_sql = format!(
            "SELECT id, call_id, caller_number, called_number, context_name, direction, \
             start_time, duration_seconds, provider_name, outcome, total_turns, \
             avg_turn_latency_ms, barge_in_count, error_message \
             FROM call_history {where_sql} ORDER BY start_time DESC LIMIT ? OFFSET ?"
        );
        let rows = bind_filters(filter, sqlx::query(&list_sql))
            .bind(filter.limit.unwrap_or(50) as i64)
            .bind(filter.offset.unwrap_or(0) as i64)
            .fetch_all(&self.pool)
            .await?;

        let records = rows
            .into_iter()
            .map(|row| CallRecordSummary {
                id: row.get("id"),
                call_id: row.get("call_id"),
                caller_number: row.get("caller_number"),
                called_number: row.get("called_number"),
                context_name: row.get("context_name"),
                direction: parse_direction(row.get::<String, _>("direction").as_str()),
                start_time: parse_time(row.get::<String, _>("start_time").as_str()),
                duration_seconds: row.get::<i64, _>("duration_seconds") as u64,
                provider_name: row.get("provider_name"),
                outcome: row
                    .get::<String, _>("outcome")
                    .parse()
                    .unwrap_or(CallOutcome::Error),
                total_turns: row.get::<i64, _>("total_turns") as u32,
                avg_turn_latency_ms: row.get("avg_turn_latency_ms"),
                barge_in_count: row.get::<i64, _>("barge_in_count") as u32,
                error_message: row.get("error_message"),
            })
            .collect();

        Ok(HistoryPage {
            records,
            total: total as u64,
        })
    }

    /// Full record, including conversation and tool calls.
    pub async fn get(&self, id: &str) -> Result<CallRecord, PersistenceError> {
        let row = sqlx::query("SELECT * FROM call_history WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(format!("call record {id}")))?;

        Ok(CallRecord {
            id: row.get("id"),
            call_id: row.get("call_id"),
            caller_number: row.get("caller_number"),
            called_number: row.get("called_number"),
            context_name: row.get("context_name"),
            direction: parse_direction(row.get::<String, _>("direction").as_str()),
            start_time: parse_time(row.get::<String, _>("start_time").as_str()),
            end_time: parse_time(row.get::<String, _>("end_time").as_str()),
            duration_seconds: row.get::<i64, _>("duration_seconds") as u64,
            provider_name: row.get("provider_name"),
            pipeline_components: serde_json::from_str(row.get::<String, _>("pipeline_components").as_str())?,
            conversation_history: serde_json::from_str(row.get::<String, _>("conversation_history").as_str())?,
            tool_calls: serde_json::from_str(row.get::<String, _>("tool_calls").as_str())?,
            pre_call_results: serde_json::from_str(row.get::<String, _>("pre_call_results").as_str())?,
            outcome: row
                .get::<String, _>("outcome")
                .parse()
                .unwrap_or(CallOutcome::Error),
            transfer_destination: row.get("transfer_destination"),
            error_message: row.get("error_message"),
            avg_turn_latency_ms: row.get("avg_turn_latency_ms"),
            max_turn_latency_ms: row.get::<i64, _>("max_turn_latency_ms") as u64,
            total_turns: row.get::<i64, _>("total_turns") as u32,
            barge_in_count: row.get::<i64, _>("barge_in_count") as u32,
            caller_audio_format: row.get("caller_audio_format"),
        })
    }

    /// Delete rows older than `retention_days`. No-op when 0.
    pub async fn sweep_retention(&self, retention_days: u32) -> Result<u64, PersistenceError> {
        if retention_days == 0 {
            return Ok(0);
        }
        let horizon = Utc::now() - Duration::days(retention_days as i64);
        let result = sqlx::query("DELETE FROM call_history WHERE start_time < ?")
            .bind(horizon.to_rfc3339())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            tracing::info!(
                deleted = result.rows_affected(),
                retention_days,
                "retention sweep removed old call records"
            );
        }
        Ok(result.rows_affected())
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

/// Bind the optional filter values in the same order the WHERE clause
/// lists them.
fn bind_filters<'q>(filter: &HistoryFilter, mut query: SqliteQuery<'q>) -> SqliteQuery<'q> {
    if let Some(caller) = &filter.caller_number {
        query = query.bind(caller.clone());
    }
    if let Some(outcome) = &filter.outcome {
        query = query.bind(outcome.as_str());
    }
    if let Some(provider) = &filter.provider_name {
        query = query.bind(provider.clone());
    }
    if let Some(after) = &filter.started_after {
        query = query.bind(after.to_rfc3339());
    }
    if let Some(before) = &filter.started_before {
        query = query.bind(before.to_rfc3339());
    }
    query
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_direction(raw: &str) -> CallDirection {
    match raw {
        "outbound" => CallDirection::Outbound,
        _ => CallDirection::Inbound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::open_test_database;
    use phone_agent_core::{CallSession, TurnRole};

    async fn store() -> CallHistoryStore {
        CallHistoryStore::new(open_test_database().await.unwrap())
    }

    fn record(caller: &str, outcome: CallOutcome) -> CallRecord {
        let mut session = CallSession::new(
            uuid::Uuid::new_v4().to_string(),
            caller,
            "15552000",
            "default",
            CallDirection::Inbound,
        );
        session.provider_name = "realtime_default".into();
        session.push_turn(TurnRole::User, "hello");
        session.push_turn(TurnRole::Assistant, "hi there");
        session.outcome = outcome;
        session.to_record(vec!["realtime:default".into()], None)
    }

    #[tokio::test]
    async fn insert_then_detail_round_trips() {
        let store = store().await;
        let record = record("15551000", CallOutcome::Completed);
        store.insert(&record).await.unwrap();

        let loaded = store.get(&record.id).await.unwrap();
        assert_eq!(loaded.call_id, record.call_id);
        assert_eq!(loaded.conversation_history.len(), 2);
        assert_eq!(loaded.conversation_history[0].content, "hello");
        assert_eq!(loaded.outcome, CallOutcome::Completed);
    }

    #[tokio::test]
    async fn summary_list_filters_and_paginates() {
        let store = store().await;
        for i in 0..5 {
            let caller = if i % 2 == 0 { "15551000" } else { "15559999" };
            store.insert(&record(caller, CallOutcome::Completed)).await.unwrap();
        }
        store
            .insert(&record("15551000", CallOutcome::Transferred))
            .await
            .unwrap();

        let page = store
            .list(&HistoryFilter {
                caller_number: Some("15551000".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 4);

        let page = store
            .list(&HistoryFilter {
                outcome: Some(CallOutcome::Transferred),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        let page = store
            .list(&HistoryFilter {
                limit: Some(2),
                offset: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.total, 6);
    }

    #[tokio::test]
    async fn missing_detail_is_not_found() {
        let store = store().await;
        assert!(matches!(
            store.get("nope").await,
            Err(PersistenceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn retention_sweep_only_removes_old_rows() {
        let store = store().await;
        let mut old = record("15551000", CallOutcome::Completed);
        old.start_time = Utc::now() - Duration::days(90);
        store.insert(&old).await.unwrap();
        store
            .insert(&record("15551000", CallOutcome::Completed))
            .await
            .unwrap();

        let deleted = store.sweep_retention(30).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.list(&HistoryFilter::default()).await.unwrap().total, 1);

        // retention 0 disables the sweep
        assert_eq!(store.sweep_retention(0).await.unwrap(), 0);
    }
}
