//! Check, status, metrics and stream handlers.

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::check::{CheckDefinition, CheckKind, CheckRequest};
use crate::db::DbError;
use crate::metrics::{ChartResponse, RangeParams, RangeQuery};
use crate::status::StatusSnapshot;
use crate::stream::{StreamEvent, StreamKey};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;

fn parse_kind(raw: &str) -> ApiResult<CheckKind> {
    Ok(raw.parse::<CheckKind>()?)
}

fn parse_id(raw: &str) -> ApiResult<i64> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid id {:?}", raw)))
}

/// The definition `id`, which must be of `kind`.
fn check_of_kind(state: &AppState, kind: CheckKind, id: i64) -> ApiResult<Arc<CheckDefinition>> {
    state
        .registry
        .get(id)
        .filter(|d| d.kind() == kind)
        .ok_or_else(|| ApiError::not_found(kind.as_str(), id))
}

/// Like [`check_of_kind`], but deleted checks are found too: their results
/// stay readable.
fn recorded_check(state: &AppState, kind: Option<CheckKind>, id: i64) -> ApiResult<Arc<CheckDefinition>> {
    let what = kind.map_or("check", CheckKind::as_str);
    let def = match state.registry.get(id) {
        Some(def) => def,
        None => match state.store.get_check_any(id) {
            Ok(def) => Arc::new(def),
            Err(DbError::NotFound) => return Err(ApiError::not_found(what, id)),
            Err(e) => return Err(e.into()),
        },
    };
    if kind.is_some_and(|k| k != def.kind()) {
        return Err(ApiError::not_found(what, id));
    }
    Ok(def)
}

// ============================================================================
// Check CRUD
// ============================================================================

pub async fn handle_create_check(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let kind = parse_kind(&kind)?;
    let req = CheckRequest::parse(kind, &body)?;
    let def = state.registry.create(req)?;
    Ok((StatusCode::CREATED, Json(def.as_ref())).into_response())
}

pub async fn handle_list_kind(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Response> {
    let kind = parse_kind(&kind)?;
    let checks = state.registry.list_kind(kind);
    let checks: Vec<&CheckDefinition> = checks.iter().map(|d| d.as_ref()).collect();
    Ok(Json(checks).into_response())
}

/// `GET /rmon/check/{a}/{b}`: `{id}/status`, `{id}/statuses`,
/// `{id}/history` or `{kind}/{id}`.
pub async fn handle_check_get(
    State(state): State<AppState>,
    Path((key, sub)): Path<(String, String)>,
) -> ApiResult<Response> {
    match sub.as_str() {
        "status" => Ok(check_status(&state, parse_id(&key)?)),
        "statuses" => check_statuses(&state, parse_id(&key)?),
        "history" => check_alerts(&state, parse_id(&key)?),
        id => {
            let def = check_of_kind(&state, parse_kind(&key)?, parse_id(id)?)?;
            Ok(Json(def.as_ref()).into_response())
        }
    }
}

pub async fn handle_update_check(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Response> {
    let kind = parse_kind(&kind)?;
    let id = parse_id(&id)?;
    check_of_kind(&state, kind, id)?;
    let req = CheckRequest::parse(kind, &body)?;
    let def = state.registry.update(id, req)?;
    Ok(Json(def.as_ref()).into_response())
}

pub async fn handle_delete_check(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let kind = parse_kind(&kind)?;
    let id = parse_id(&id)?;
    check_of_kind(&state, kind, id)?;
    state.registry.delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    #[serde(alias = "from_agent")]
    pub from: i64,
    #[serde(alias = "to_agent")]
    pub to: i64,
}

pub async fn handle_move_checks(
    State(state): State<AppState>,
    Json(req): Json<MoveRequest>,
) -> ApiResult<Response> {
    let moved = state.registry.move_checks(req.from, req.to)?;
    Ok(Json(json!({ "status": "ok", "moved": moved })).into_response())
}

// ============================================================================
// Status
// ============================================================================

fn check_status(state: &AppState, id: i64) -> Response {
    match state.tracker.snapshot(id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "check_id": id, "status": 3 })),
        )
            .into_response(),
    }
}

/// Alerts returned by the history view.
const ALERT_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Serialize)]
struct StatusEntry {
    status: u8,
    date: DateTime<Utc>,
    error: String,
}

/// Recent statuses, newest first. Deleted checks are served from the store.
fn check_statuses(state: &AppState, id: i64) -> ApiResult<Response> {
    let entries: Vec<StatusEntry> = if state.registry.get(id).is_some() {
        state
            .tracker
            .history(id)
            .into_iter()
            .map(|s| StatusEntry {
                status: s.status.code(),
                date: s.time,
                error: s.message,
            })
            .collect()
    } else {
        recorded_check(state, None, id)?;
        state
            .store
            .recent_results(id, state.tracker.window())?
            .into_iter()
            .map(|r| StatusEntry {
                status: r.status.code(),
                date: r.ingested_at,
                error: r.message,
            })
            .collect()
    };
    Ok(Json(entries).into_response())
}

/// Alerts fired for a check, newest first.
fn check_alerts(state: &AppState, id: i64) -> ApiResult<Response> {
    recorded_check(state, None, id)?;
    let alerts = state.store.alerts_for_check(id, ALERT_HISTORY_LIMIT)?;
    Ok(Json(alerts).into_response())
}

#[derive(Serialize)]
struct CheckListing<'a> {
    #[serde(flatten)]
    check: &'a CheckDefinition,
    state: Option<StatusSnapshot>,
}

fn listing(state: &AppState, defs: &[Arc<CheckDefinition>]) -> Response {
    let items: Vec<CheckListing> = defs
        .iter()
        .map(|d| CheckListing {
            check: d,
            state: state.tracker.snapshot(d.id),
        })
        .collect();
    Json(items).into_response()
}

pub async fn handle_list_checks(State(state): State<AppState>) -> Response {
    listing(&state, &state.registry.list())
}

pub async fn handle_list_checks_kind(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Response> {
    let kind = parse_kind(&kind)?;
    Ok(listing(&state, &state.registry.list_kind(kind)))
}

// ============================================================================
// Metrics
// ============================================================================

pub async fn handle_check_metrics(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Response> {
    let kind = parse_kind(&kind)?;
    let id = parse_id(&id)?;
    recorded_check(&state, Some(kind), id)?;

    let range = RangeQuery::parse(&params, Utc::now()).map_err(ApiError::BadRequest)?;
    let chart_data = state
        .metrics
        .query(id, kind, &range, state.tracker.window())?;
    Ok(Json(ChartResponse { chart_data }).into_response())
}

/// Live updates for one check. The latest stored result, if any, is sent
/// first; the subscription ends when the client goes away.
pub async fn handle_metrics_stream(
    State(state): State<AppState>,
    Path((check_id, type_id)): Path<(i64, u8)>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let def = state
        .registry
        .get(check_id)
        .filter(|d| d.kind().type_id() == type_id)
        .ok_or_else(|| ApiError::not_found("check", check_id))?;

    let subscription = state.streams.subscribe(StreamKey { check_id, type_id });

    let initial = state
        .store
        .latest_result(check_id)?
        .map(|r| StreamEvent::new(&def, &r, state.tracker.snapshot(check_id).as_ref()));

    let live = stream::unfold(subscription, |mut sub| async move {
        let event = sub.next().await?;
        Some((event, sub))
    });
    let events = stream::iter(initial.map(Arc::new))
        .chain(live)
        .filter_map(|e| async move {
            match Event::default().json_data(e.as_ref()) {
                Ok(ev) => Some(Ok(ev)),
                Err(err) => {
                    tracing::warn!("Failed to encode stream event: {}", err);
                    None
                }
            }
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
