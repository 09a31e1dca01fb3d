//! HTTP endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tower_http::trace::TraceLayer;

use phone_agent_config::load_settings;
use phone_agent_persistence::{CampaignState, HistoryFilter, NewCampaign, NewLead};
use phone_agent_providers::ProviderRegistry;

use crate::metrics::metrics_handler;
use crate::AppState;

/// Create the admin router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        // Call history
        .route("/api/calls", get(list_calls))
        .route("/api/calls/:id", get(get_call))
        // Campaign control
        .route("/api/campaigns", post(create_campaign))
        .route("/api/campaigns", get(list_campaigns))
        .route("/api/campaigns/:id/start", post(start_campaign))
        .route("/api/campaigns/:id/pause", post(pause_campaign))
        .route("/api/campaigns/:id/leads", post(add_leads))
        // Hot reload (tools, pipeline selection)
        .route("/admin/reload-config", post(reload_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /health`: process health plus PBX reachability.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let asterisk_reachable = state.handles.ari.ping().await;
    let providers = state.handles.providers.snapshot().names();
    let body = json!({
        "status": if asterisk_reachable { "ok" } else { "degraded" },
        "active_calls": state.handles.sessions.len(),
        "asterisk_reachable": asterisk_reachable,
        "providers": providers,
    });
    let status = if asterisk_reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Debug, Deserialize)]
struct CallListQuery {
    caller_number: Option<String>,
    outcome: Option<String>,
    provider: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

/// `GET /api/calls`: summary projection, paginated.
async fn list_calls(
    State(state): State<AppState>,
    Query(query): Query<CallListQuery>,
) -> impl IntoResponse {
    let filter = HistoryFilter {
        caller_number: query.caller_number,
        outcome: query.outcome.and_then(|raw| raw.parse().ok()),
        provider_name: query.provider,
        limit: query.limit,
        offset: query.offset,
        ..Default::default()
    };
    match state.handles.persistence.call_history.list(&filter).await {
        Ok(page) => (StatusCode::OK, Json(json!(page))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

/// `GET /api/calls/:id`: full record including conversation and tools.
async fn get_call(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.handles.persistence.call_history.get(&id).await {
        Ok(record) => (StatusCode::OK, Json(json!(record))).into_response(),
        Err(phone_agent_persistence::PersistenceError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CreateCampaignRequest {
    name: String,
    context_name: String,
    #[serde(default)]
    timezone: String,
    #[serde(default)]
    window_start: String,
    #[serde(default)]
    window_end: String,
    #[serde(default = "default_max_concurrent")]
    max_concurrent: u32,
    #[serde(default)]
    min_interval_ms: u64,
    #[serde(default)]
    consent_required: bool,
    #[serde(default)]
    voicemail_drop_enabled: bool,
    #[serde(default)]
    voicemail_media_uri: Option<String>,
    #[serde(default)]
    caller_id: Option<String>,
}

fn default_max_concurrent() -> u32 {
    1
}

async fn create_campaign(
    State(state): State<AppState>,
    Json(request): Json<CreateCampaignRequest>,
) -> impl IntoResponse {
    let Some(dialer) = &state.handles.dialer else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "dialer disabled"})),
        )
            .into_response();
    };
    let new = NewCampaign {
        name: request.name,
        context_name: request.context_name,
        timezone: request.timezone,
        window_start: request.window_start,
        window_end: request.window_end,
        max_concurrent: request.max_concurrent,
        min_interval_ms: request.min_interval_ms,
        consent_required: request.consent_required,
        voicemail_drop_enabled: request.voicemail_drop_enabled,
        voicemail_media_uri: request.voicemail_media_uri,
        caller_id: request.caller_id,
    };
    match dialer.store().create_campaign(new).await {
        Ok(campaign) => (StatusCode::CREATED, Json(json!(campaign))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn list_campaigns(State(state): State<AppState>) -> impl IntoResponse {
    let Some(dialer) = &state.handles.dialer else {
        return (StatusCode::OK, Json(json!([]))).into_response();
    };
    match dialer.store().list_campaigns().await {
        Ok(campaigns) => (StatusCode::OK, Json(json!(campaigns))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn start_campaign(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    set_campaign_state(state, id, CampaignState::Running).await
}

async fn pause_campaign(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    set_campaign_state(state, id, CampaignState::Paused).await
}

async fn set_campaign_state(
    state: AppState,
    id: String,
    campaign_state: CampaignState,
) -> axum::response::Response {
    let Some(dialer) = &state.handles.dialer else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "dialer disabled"})),
        )
            .into_response();
    };
    match dialer.store().set_campaign_state(&id, campaign_state).await {
        Ok(()) => (StatusCode::OK, Json(json!({"state": campaign_state}))).into_response(),
        Err(phone_agent_persistence::PersistenceError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AddLeadRequest {
    number: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    custom_vars: HashMap<String, String>,
}

async fn add_leads(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(leads): Json<Vec<AddLeadRequest>>,
) -> impl IntoResponse {
    let Some(dialer) = &state.handles.dialer else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "dialer disabled"})),
        )
            .into_response();
    };
    let mut created = 0u32;
    for lead in leads {
        let new = NewLead {
            campaign_id: id.clone(),
            number: lead.number,
            name: lead.name,
            custom_vars: lead.custom_vars,
        };
        match dialer.store().add_lead(new).await {
            Ok(_) => created += 1,
            Err(e) => return internal_error(e).into_response(),
        }
    }
    (StatusCode::CREATED, Json(json!({"created": created}))).into_response()
}

/// `POST /admin/reload-config`: rebuild the hot-reloadable subset (tool
/// definitions, provider/pipeline selection) from the config files and
/// swap atomically. Calls in flight keep their snapshots.
async fn reload_config(State(state): State<AppState>) -> impl IntoResponse {
    let env = std::env::var("PHONE_AGENT_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("config invalid, keeping current: {e}")})),
            )
                .into_response();
        }
    };

    let actions = std::sync::Arc::new(phone_agent_engine::engine::EngineCallActions {
        ari: state.handles.ari.clone(),
        sessions: state.handles.sessions.clone(),
        stasis_app: state.handles.ari.app().to_string(),
    });
    state
        .handles
        .tools
        .swap(phone_agent_tools::build_registry(&settings, actions));
    state
        .handles
        .providers
        .swap(ProviderRegistry::from_settings(&settings));
    if let Err(e) = state.handles.config.reload(settings) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        )
            .into_response();
    }

    (StatusCode::OK, Json(json!({"status": "reloaded"}))).into_response()
}

fn internal_error(error: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    tracing::error!("admin request failed: {error}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": error.to_string()})),
    )
}
