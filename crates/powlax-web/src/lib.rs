//! HTTP surface for triggering, inspecting and cancelling GamiPress syncs.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use powlax_core::{EntityType, NewSyncLogEntry, SyncAction, SyncLogEntry, SyncStats};
use powlax_store::SyncLogStore;
use powlax_sync::{maybe_build_scheduler, SyncConfig, SyncError, SyncOrchestrator, SyncRequest};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::{error::Category, json, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "powlax-web";
pub const SYNC_ROUTE: &str = "/gamipress/sync";

const DEFAULT_STATUS_LIMIT: i64 = 10;
const MAX_STATUS_LIMIT: i64 = 500;
const AGGREGATE_WINDOW: i64 = 100;
const USER_IDS_ERROR: &str = "user_ids must be an array of numbers";
const FLAG_ERROR: &str = "force_full_sync and dry_run must be booleans";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SyncOrchestrator,
    api_token_digest: Option<String>,
}

impl AppState {
    pub fn new(orchestrator: SyncOrchestrator, api_token: Option<String>) -> Self {
        Self {
            orchestrator,
            api_token_digest: api_token.as_deref().map(token_digest),
        }
    }

    fn check_bearer(&self, headers: &HeaderMap) -> Result<(), &'static str> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or("Missing or invalid authorization header")?;
        match &self.api_token_digest {
            Some(expected) if token_digest(token) != *expected => Err("Invalid API token"),
            _ => Ok(()),
        }
    }

    async fn audit(&self, entry: NewSyncLogEntry) {
        self.orchestrator.audit().append(entry).await;
    }

    fn log_store(&self) -> &Arc<dyn SyncLogStore> {
        self.orchestrator.audit().store()
    }
}

fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            SYNC_ROUTE,
            post(trigger_sync_handler)
                .get(sync_status_handler)
                .delete(cancel_sync_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig, orchestrator: SyncOrchestrator) -> anyhow::Result<()> {
    if config.api_token.is_none() {
        warn!("POWLAX_SYNC_API_TOKEN is not set; sync requests are accepted with any bearer token");
    }
    let scheduler = maybe_build_scheduler(config, orchestrator.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, source = orchestrator.source_name(), "sync api listening");
    axum::serve(listener, app(AppState::new(orchestrator, config.api_token.clone()))).await?;
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
struct TriggerBody {
    #[serde(deserialize_with = "user_id_list")]
    user_ids: Option<Vec<i64>>,
    #[serde(deserialize_with = "flag")]
    force_full_sync: bool,
    #[serde(deserialize_with = "flag")]
    dry_run: bool,
}

fn user_id_list<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<i64>>, D::Error> {
    Option::<Vec<i64>>::deserialize(de).map_err(|_| D::Error::custom(USER_IDS_ERROR))
}

/// `null` reads as `false`.
fn flag<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    Option::<bool>::deserialize(de)
        .map(Option::unwrap_or_default)
        .map_err(|_| D::Error::custom(FLAG_ERROR))
}

fn parse_trigger_body(raw: &[u8]) -> Result<TriggerBody, String> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(TriggerBody::default());
    }
    serde_json::from_slice(raw).map_err(|err| match err.classify() {
        Category::Data => err.to_string(),
        _ => format!("invalid JSON body: {err}"),
    })
}

fn header_or_unknown(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

fn failure(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(json!({ "success": false, "error": error.into() }))).into_response()
}

async fn trigger_sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = match parse_trigger_body(&body) {
        Ok(body) => body,
        Err(msg) => return failure(StatusCode::BAD_REQUEST, msg),
    };
    if let Err(msg) = state.check_bearer(&headers) {
        return failure(StatusCode::UNAUTHORIZED, msg);
    }

    let request = SyncRequest::new()
        .with_user_ids(body.user_ids.clone())
        .full(body.force_full_sync);
    let sync_id = request.sync_id;
    state
        .audit(NewSyncLogEntry::new(
            EntityType::SyncApiRequest,
            0,
            sync_id.to_string(),
            SyncAction::Created,
            json!({
                "user_ids": body.user_ids,
                "force_full_sync": body.force_full_sync,
                "dry_run": body.dry_run,
                "request_ip": header_or_unknown(&headers, "x-forwarded-for"),
                "user_agent": header_or_unknown(&headers, "user-agent"),
            }),
        ))
        .await;
    info!(%sync_id, dry_run = body.dry_run, "sync requested over http");

    if body.dry_run {
        return Json(json!({
            "success": true,
            "sync_id": sync_id,
            "stats": SyncStats::empty_at(Utc::now()),
            "message": "Dry run completed - no data was actually synced",
        }))
        .into_response();
    }

    match state.orchestrator.run_sync(request).await {
        Ok(stats) => {
            state
                .audit(NewSyncLogEntry::new(
                    EntityType::SyncApiResponse,
                    0,
                    sync_id.to_string(),
                    SyncAction::Updated,
                    json!({ "success": true, "stats": stats }),
                ))
                .await;
            Json(json!({ "success": true, "sync_id": sync_id, "stats": stats })).into_response()
        }
        Err(err) => {
            let status = match err {
                SyncError::AlreadyRunning { .. } => StatusCode::CONFLICT,
                SyncError::Fetch(_) | SyncError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error!(%sync_id, error = %err, "http sync failed");
            state
                .audit(
                    NewSyncLogEntry::new(
                        EntityType::SyncApiError,
                        0,
                        sync_id.to_string(),
                        SyncAction::Failed,
                        json!({ "error": err.to_string() }),
                    )
                    .with_error(err.to_string()),
                )
                .await;
            failure(status, err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    sync_id: Option<String>,
    limit: Option<String>,
}

fn aggregate(rows: &[SyncLogEntry]) -> Value {
    let count = |actions: &[SyncAction]| {
        rows.iter()
            .filter(|r| actions.iter().any(|a| r.action == a.as_str()))
            .count()
    };
    json!({
        "total_syncs": rows.len(),
        "successful_syncs": count(&[SyncAction::Updated, SyncAction::Created]),
        "failed_syncs": count(&[SyncAction::Failed]),
        "last_sync": rows.first().map(|r| r.synced_at),
    })
}

async fn sync_status_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let store = state.log_store();

    if let Some(sync_id) = query.sync_id.filter(|s| !s.is_empty()) {
        return match store.entries_for_local_id(&sync_id).await {
            Ok(logs) => Json(json!({ "success": true, "sync_id": sync_id, "logs": logs })).into_response(),
            Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
    }

    let limit = query
        .limit
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_STATUS_LIMIT)
        .min(MAX_STATUS_LIMIT);
    let kinds = [
        EntityType::SyncSession,
        EntityType::SyncApiRequest,
        EntityType::SyncApiResponse,
    ];
    let recent = match store.recent_entries(&kinds, limit).await {
        Ok(rows) => rows,
        Err(err) => return failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let stats = match store.recent_all(AGGREGATE_WINDOW).await {
        Ok(rows) => aggregate(&rows),
        Err(err) => {
            warn!(error = %err, "sync log aggregation failed");
            Value::Null
        }
    };

    Json(json!({
        "success": true,
        "recent_syncs": recent,
        "stats": stats,
        "in_flight": state.orchestrator.guard().current_sync_id(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct CancelQuery {
    sync_id: Option<String>,
}

async fn cancel_sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CancelQuery>,
) -> Response {
    let Some(sync_id) = query.sync_id.filter(|s| !s.trim().is_empty()) else {
        return failure(StatusCode::BAD_REQUEST, "sync_id parameter is required");
    };

    let signalled = state.orchestrator.request_cancel(&sync_id);
    info!(sync_id = %sync_id, signalled, "sync cancellation requested");
    state
        .audit(NewSyncLogEntry::new(
            EntityType::SyncCancellation,
            0,
            sync_id.clone(),
            SyncAction::Updated,
            json!({
                "cancelled_at": Utc::now(),
                "request_ip": header_or_unknown(&headers, "x-forwarded-for"),
                "signalled_running_sync": signalled,
            }),
        ))
        .await;

    Json(json!({
        "success": true,
        "message": "Sync cancellation requested",
        "sync_id": sync_id,
        "signalled_running_sync": signalled,
    }))
    .into_response()
}
