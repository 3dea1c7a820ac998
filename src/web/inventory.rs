//! Placement entities, status pages and notification channels.

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::db::{Agent, Channel, ChannelConfig, CheckStatus, Country, DbError, Region, StatusPage};
use crate::status::{page_operational, validate_slug};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Serialize;
use serde_json::{json, Value};

fn require_name(name: &str) -> ApiResult<()> {
    if name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    Ok(())
}

/// Map a missing row to a 404 naming the entity.
fn found<T>(what: &str, id: i64, r: Result<T, DbError>) -> ApiResult<T> {
    match r {
        Err(DbError::NotFound) => Err(ApiError::not_found(what, id)),
        other => Ok(other?),
    }
}

/// A referenced entity must exist, or the request is invalid.
fn reference<T>(what: &str, id: i64, r: Result<T, DbError>) -> ApiResult<()> {
    match r {
        Ok(_) => Ok(()),
        Err(DbError::NotFound) => Err(ApiError::BadRequest(format!("{} {} does not exist", what, id))),
        Err(e) => Err(e.into()),
    }
}

/// Refuse to delete a placement entity that checks still run on.
fn ensure_unused(what: &str, id: i64, placed: usize) -> ApiResult<()> {
    if placed > 0 {
        return Err(ApiError::Conflict(format!(
            "{} {} still runs {} check(s); move them first",
            what, id, placed
        )));
    }
    Ok(())
}

/// Agents or regions changed: re-resolve where every check runs.
fn reconcile_placement(state: &AppState) -> ApiResult<()> {
    let agents = state.store.get_agents()?;
    let regions = state.store.get_regions()?;
    state.tracker.reconcile(&agents, &regions);
    Ok(())
}

// ============================================================================
// Agents
// ============================================================================

fn validate_agent(state: &AppState, agent: &Agent) -> ApiResult<()> {
    require_name(&agent.name)?;
    if let Some(region) = agent.region_id {
        reference("region", region, state.store.get_region(region))?;
    }
    Ok(())
}

pub async fn handle_list_agents(State(state): State<AppState>) -> ApiResult<Json<Vec<Agent>>> {
    Ok(Json(state.store.get_agents()?))
}

pub async fn handle_create_agent(
    State(state): State<AppState>,
    Json(mut agent): Json<Agent>,
) -> ApiResult<(StatusCode, Json<Agent>)> {
    validate_agent(&state, &agent)?;
    state.store.add_agent(&mut agent)?;
    tracing::info!("Created agent {} ({})", agent.id, agent.name);
    reconcile_placement(&state)?;
    Ok((StatusCode::CREATED, Json(agent)))
}

pub async fn handle_get_agent(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(found("agent", id, state.store.get_agent(id))?))
}

pub async fn handle_update_agent(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(mut agent): Json<Agent>,
) -> ApiResult<Json<Agent>> {
    agent.id = id;
    validate_agent(&state, &agent)?;
    found("agent", id, state.store.update_agent(&agent))?;
    reconcile_placement(&state)?;
    Ok(Json(agent))
}

pub async fn handle_delete_agent(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    ensure_unused("agent", id, state.registry.count_on_agent(id))?;
    found("agent", id, state.store.delete_agent(id))?;
    reconcile_placement(&state)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Regions
// ============================================================================

fn validate_region(state: &AppState, region: &Region) -> ApiResult<()> {
    require_name(&region.name)?;
    if let Some(country) = region.country_id {
        reference("country", country, state.store.get_country(country))?;
    }
    Ok(())
}

pub async fn handle_list_regions(State(state): State<AppState>) -> ApiResult<Json<Vec<Region>>> {
    Ok(Json(state.store.get_regions()?))
}

pub async fn handle_create_region(
    State(state): State<AppState>,
    Json(mut region): Json<Region>,
) -> ApiResult<(StatusCode, Json<Region>)> {
    validate_region(&state, &region)?;
    state.store.add_region(&mut region)?;
    Ok((StatusCode::CREATED, Json(region)))
}

pub async fn handle_get_region(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Region>> {
    Ok(Json(found("region", id, state.store.get_region(id))?))
}

pub async fn handle_update_region(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(mut region): Json<Region>,
) -> ApiResult<Json<Region>> {
    region.id = id;
    validate_region(&state, &region)?;
    found("region", id, state.store.update_region(&region))?;
    reconcile_placement(&state)?;
    Ok(Json(region))
}

pub async fn handle_delete_region(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    ensure_unused("region", id, state.registry.count_in_region(id))?;
    found("region", id, state.store.delete_region(id))?;
    reconcile_placement(&state)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Countries
// ============================================================================

pub async fn handle_list_countries(State(state): State<AppState>) -> ApiResult<Json<Vec<Country>>> {
    Ok(Json(state.store.get_countries()?))
}

pub async fn handle_create_country(
    State(state): State<AppState>,
    Json(mut country): Json<Country>,
) -> ApiResult<(StatusCode, Json<Country>)> {
    require_name(&country.name)?;
    state.store.add_country(&mut country)?;
    Ok((StatusCode::CREATED, Json(country)))
}

pub async fn handle_get_country(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Country>> {
    Ok(Json(found("country", id, state.store.get_country(id))?))
}

pub async fn handle_update_country(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(mut country): Json<Country>,
) -> ApiResult<Json<Country>> {
    country.id = id;
    require_name(&country.name)?;
    found("country", id, state.store.update_country(&country))?;
    Ok(Json(country))
}

pub async fn handle_delete_country(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    ensure_unused("country", id, state.registry.count_in_country(id))?;
    found("country", id, state.store.delete_country(id))?;
    reconcile_placement(&state)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Status pages
// ============================================================================

fn validate_page(state: &AppState, page: &StatusPage) -> ApiResult<()> {
    require_name(&page.name)?;
    validate_slug(&page.slug).map_err(ApiError::BadRequest)?;
    if let Some(missing) = page.checks.iter().find(|id| state.registry.get(**id).is_none()) {
        return Err(ApiError::BadRequest(format!("check {} does not exist", missing)));
    }
    Ok(())
}

/// Current status of each member that still exists, in page order.
fn member_statuses(state: &AppState, page: &StatusPage) -> Vec<(i64, CheckStatus)> {
    page.checks
        .iter()
        .filter_map(|id| state.tracker.snapshot(*id).map(|s| (*id, s.status)))
        .collect()
}

pub async fn handle_list_status_pages(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<StatusPage>>> {
    Ok(Json(state.store.get_status_pages()?))
}

pub async fn handle_create_status_page(
    State(state): State<AppState>,
    Json(mut page): Json<StatusPage>,
) -> ApiResult<(StatusCode, Json<StatusPage>)> {
    validate_page(&state, &page)?;
    state.store.add_status_page(&mut page)?;
    Ok((StatusCode::CREATED, Json(page)))
}

pub async fn handle_get_status_page(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<StatusPage>> {
    Ok(Json(found("status page", id, state.store.get_status_page(id))?))
}

pub async fn handle_update_status_page(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(mut page): Json<StatusPage>,
) -> ApiResult<Json<StatusPage>> {
    page.id = id;
    validate_page(&state, &page)?;
    found("status page", id, state.store.update_status_page(&page))?;
    Ok(Json(page))
}

pub async fn handle_delete_status_page(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    found("status page", id, state.store.delete_status_page(id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_status_page_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let page = found("status page", id, state.store.get_status_page(id))?;
    let operational = page_operational(member_statuses(&state, &page).into_iter().map(|(_, s)| s));
    Ok(Json(json!({ "operational": operational })))
}

#[derive(Serialize)]
struct PageMember {
    id: i64,
    name: String,
    status: CheckStatus,
    uptime: f64,
}

#[derive(Serialize)]
pub struct PublicPage {
    #[serde(flatten)]
    page: StatusPage,
    operational: bool,
    members: Vec<PageMember>,
}

pub async fn handle_status_page_by_slug(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<PublicPage>> {
    let page = match state.store.get_status_page_by_slug(&slug) {
        Err(DbError::NotFound) => return Err(ApiError::NotFound(format!("status page {:?} not found", slug))),
        other => other?,
    };

    let members: Vec<PageMember> = page
        .checks
        .iter()
        .filter_map(|id| {
            let def = state.registry.get(*id)?;
            let snapshot = state.tracker.snapshot(*id)?;
            Some(PageMember {
                id: *id,
                name: def.name.clone(),
                status: snapshot.status,
                uptime: snapshot.uptime,
            })
        })
        .collect();
    let operational = page_operational(members.iter().map(|m| m.status));

    Ok(Json(PublicPage {
        page,
        operational,
        members,
    }))
}

// ============================================================================
// Notification channels
// ============================================================================

fn validate_channel(channel: &Channel) -> ApiResult<()> {
    require_name(&channel.name)?;
    let empty = match &channel.config {
        ChannelConfig::Telegram { token, chat_id } => token.is_empty() || chat_id.is_empty(),
        ChannelConfig::Slack { webhook_url } | ChannelConfig::Mattermost { webhook_url } => {
            webhook_url.is_empty()
        }
        ChannelConfig::Pagerduty { routing_key } => routing_key.is_empty(),
        ChannelConfig::Email { recipients } => recipients.is_empty(),
    };
    if empty {
        return Err(ApiError::BadRequest(format!(
            "{} channel is missing required settings",
            channel.config.kind().as_str()
        )));
    }
    Ok(())
}

pub async fn handle_list_channels(State(state): State<AppState>) -> ApiResult<Json<Vec<Channel>>> {
    Ok(Json(state.store.get_channels()?))
}

pub async fn handle_create_channel(
    State(state): State<AppState>,
    Json(mut channel): Json<Channel>,
) -> ApiResult<(StatusCode, Json<Channel>)> {
    validate_channel(&channel)?;
    state.store.add_channel(&mut channel)?;
    Ok((StatusCode::CREATED, Json(channel)))
}

pub async fn handle_get_channel(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Channel>> {
    Ok(Json(found("channel", id, state.store.get_channel(id))?))
}

pub async fn handle_update_channel(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(mut channel): Json<Channel>,
) -> ApiResult<Json<Channel>> {
    channel.id = id;
    validate_channel(&channel)?;
    found("channel", id, state.store.update_channel(&channel))?;
    Ok(Json(channel))
}

pub async fn handle_delete_channel(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    found("channel", id, state.store.delete_channel(id))?;
    Ok(StatusCode::NO_CONTENT)
}
