//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, Destination, OutageFilter, ResetScope, Source};
use crate::notify::Notifier;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Word the caller must send to reset outage history.
pub const RESET_CONFIRMATION: &str = "RESET";

fn db_error_response(e: DbError) -> Response {
    match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, "Not found").into_response(),
        e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// Health
// ============================================================================

pub async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "time": Utc::now() }))
}

// ============================================================================
// API: Sources
// ============================================================================

pub async fn handle_get_sources(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_sources() {
        Ok(sources) => Json(sources).into_response(),
        Err(e) => db_error_response(e),
    }
}

/// Reject sources the scheduler could not poll.
pub fn validate_source(source: &Source) -> Result<(), String> {
    if source.id.trim().is_empty() {
        return Err("Source id is required".to_string());
    }
    if source.name.trim().is_empty() {
        return Err("Source name is required".to_string());
    }
    if !(source.base_url.starts_with("http://") || source.base_url.starts_with("https://")) {
        return Err("base_url must be an http(s) URL".to_string());
    }
    if let Some(pattern) = source.exclude_pattern.as_deref().filter(|p| !p.trim().is_empty()) {
        Regex::new(pattern).map_err(|e| format!("Invalid exclude_pattern: {}", e))?;
    }
    if source.maintenance.days_of_week.iter().any(|d| *d > 6) {
        return Err("days_of_week must be 0 (Sunday) to 6 (Saturday)".to_string());
    }
    Ok(())
}

pub async fn handle_create_source(State(state): State<AppState>, Json(source): Json<Source>) -> impl IntoResponse {
    if let Err(msg) = validate_source(&source) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    if state.store.get_source(&source.id).is_ok() {
        return (StatusCode::CONFLICT, "Source already exists").into_response();
    }

    match state.store.add_source(&source) {
        Ok(()) => {
            tracing::info!("API: added source \"{}\" ({})", source.name, source.id);
            (StatusCode::CREATED, Json(source)).into_response()
        }
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_update_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut source): Json<Source>,
) -> impl IntoResponse {
    source.id = id;
    if let Err(msg) = validate_source(&source) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }

    // An empty password keeps the stored one.
    if source.password.is_empty() {
        match state.store.get_source(&source.id) {
            Ok(existing) => source.password = existing.password,
            Err(e) => return db_error_response(e),
        }
    }

    match state.store.update_source(&source) {
        Ok(()) => Json(source).into_response(),
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_delete_source(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if let Err(e) = state.store.get_source(&id) {
        return db_error_response(e);
    }
    match state.store.delete_source(&id) {
        Ok(()) => {
            tracing::info!("API: deleted source {}", id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_get_channels(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if let Err(e) = state.store.get_source(&id) {
        return db_error_response(e);
    }
    match state.store.get_monitored_channels(&id) {
        Ok(channels) => Json(channels).into_response(),
        Err(e) => db_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SetChannelRequest {
    pub enabled: bool,
}

pub async fn handle_set_channel_enabled(
    State(state): State<AppState>,
    Path((id, channel_id)): Path<(String, String)>,
    Json(req): Json<SetChannelRequest>,
) -> impl IntoResponse {
    match state.store.set_channel_enabled(&id, &channel_id, req.enabled) {
        Ok(()) => {
            tracing::info!("API: channel {} on source {} enabled={}", channel_id, id, req.enabled);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => db_error_response(e),
    }
}

// ============================================================================
// API: Reports
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub source_id: Option<String>,
}

pub async fn handle_get_status(State(state): State<AppState>, Query(q): Query<StatusQuery>) -> impl IntoResponse {
    match state.store.get_statuses(q.source_id.as_deref()) {
        Ok(statuses) => Json(statuses).into_response(),
        Err(e) => db_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct OutagesQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub source_id: Option<String>,
    pub channel_id: Option<String>,
    pub limit: Option<usize>,
}

pub async fn handle_get_outages(State(state): State<AppState>, Query(q): Query<OutagesQuery>) -> impl IntoResponse {
    let filter = OutageFilter {
        start: q.start,
        end: q.end,
        source_id: q.source_id.filter(|s| !s.is_empty()),
        channel_id: q.channel_id.filter(|s| !s.is_empty()),
    };

    match state.store.query_outages(&filter, q.limit) {
        Ok(report) => Json(report).into_response(),
        Err(e) => db_error_response(e),
    }
}

// ============================================================================
// API: Admin
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResetError {
    #[error("confirmation required: send confirm=\"RESET\"")]
    NotConfirmed,
    #[error("scope required: send source_id=\"all\" or a source id")]
    MissingScope,
}

/// Destructive resets only proceed with the exact confirmation word.
pub fn check_confirmation(confirm: Option<&str>) -> Result<(), ResetError> {
    match confirm {
        Some(RESET_CONFIRMATION) => Ok(()),
        _ => Err(ResetError::NotConfirmed),
    }
}

/// The scope of a reset must be named; `"all"` is never implied.
pub fn reset_scope(source_id: Option<&str>) -> Result<ResetScope, ResetError> {
    source_id.and_then(ResetScope::parse).ok_or(ResetError::MissingScope)
}

#[derive(Debug, Deserialize)]
pub struct ResetQuery {
    pub source_id: Option<String>,
}

pub async fn handle_reset_history_dry(
    State(state): State<AppState>,
    Query(q): Query<ResetQuery>,
) -> impl IntoResponse {
    let scope = match reset_scope(q.source_id.as_deref()) {
        Ok(scope) => scope,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    match state.store.count_history(&scope) {
        Ok(counts) => Json(json!({ "scope": scope.to_string(), "would_delete": counts })).into_response(),
        Err(e) => db_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub source_id: Option<String>,
    pub confirm: Option<String>,
}

pub async fn handle_reset_history(State(state): State<AppState>, Json(req): Json<ResetRequest>) -> impl IntoResponse {
    if let Err(e) = check_confirmation(req.confirm.as_deref()) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    let scope = match reset_scope(req.source_id.as_deref()) {
        Ok(scope) => scope,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    match state.store.reset_history(&scope) {
        Ok(counts) => Json(json!({ "scope": scope.to_string(), "deleted": counts })).into_response(),
        Err(e) => db_error_response(e),
    }
}

// ============================================================================
// API: Destinations
// ============================================================================

const SECRET_KEYS: [&str; 5] = ["bot_token", "botToken", "api_key", "apiKey", "apikey"];

fn redacted(destination: Destination) -> Destination {
    let mut config = destination.config;
    if let Value::Object(map) = &mut config {
        for key in SECRET_KEYS {
            if let Some(v) = map.get_mut(key) {
                *v = Value::String("***".to_string());
            }
        }
    }
    Destination { config, ..destination }
}

pub async fn handle_get_destinations(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_destinations() {
        Ok(destinations) => Json(destinations.into_iter().map(redacted).collect::<Vec<_>>()).into_response(),
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_create_destination(
    State(state): State<AppState>,
    Json(mut destination): Json<Destination>,
) -> impl IntoResponse {
    let notifier = match Notifier::new(state.config.notify_timeout) {
        Ok(notifier) => notifier,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    if let Err(e) = notifier.sender_for(&destination) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    match state.store.add_destination(&mut destination) {
        Ok(_) => {
            tracing::info!("API: added {} destination {}", destination.kind, destination.id);
            (StatusCode::CREATED, Json(redacted(destination))).into_response()
        }
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_delete_destination(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.store.delete_destination(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => db_error_response(e),
    }
}

// ============================================================================
// API: Settings
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SettingRequest {
    pub value: String,
}

pub async fn handle_get_setting(State(state): State<AppState>, Path(key): Path<String>) -> impl IntoResponse {
    match state.store.get_setting(&key) {
        Ok(Some(value)) => Json(json!({ "key": key, "value": value })).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Setting not found").into_response(),
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_put_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<SettingRequest>,
) -> impl IntoResponse {
    match state.store.set_setting(&key, &req.value) {
        Ok(()) => Json(json!({ "key": key, "value": req.value })).into_response(),
        Err(e) => db_error_response(e),
    }
}
