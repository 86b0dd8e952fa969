//! Tab management routes.

use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tabterm_core::{OutputClassification, TabtermError};
use tabterm_types::{
    CommandHistoryEntry, ConnectionState, SessionOverview, Tab, TabGroup, TabKind, TabSpec,
};
use tracing::{info, warn};
use uuid::Uuid;

type ApiError = (StatusCode, String);

/// Map core errors onto HTTP statuses.
pub fn error_response(e: TabtermError) -> ApiError {
    let status = match &e {
        TabtermError::TabNotFound(_) => StatusCode::NOT_FOUND,
        TabtermError::NotConnected(_) => StatusCode::CONFLICT,
        TabtermError::NotClosable(_) => StatusCode::FORBIDDEN,
        TabtermError::ProcessNotFound(_) | TabtermError::ProcessDead(_) => StatusCode::GONE,
        TabtermError::SpawnError(_) | TabtermError::ServiceFailure(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(target: "tabterm::api", "Request failed: {}", e);
    }
    (status, e.to_string())
}

/// Parse `global`, `project:<id>` or `resource:<id>`.
pub fn parse_group(s: &str) -> Option<TabGroup> {
    match s.split_once(':') {
        None if s == "global" => Some(TabGroup::Global),
        Some(("project", id)) if !id.is_empty() => Some(TabGroup::Project(id.to_string())),
        Some(("resource", id)) if !id.is_empty() => Some(TabGroup::Resource(id.to_string())),
        _ => None,
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Serialize)]
pub struct TabListResponse {
    pub tabs: Vec<Tab>,
    /// Active tab of the requested group, if one was requested.
    pub active: Option<Uuid>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<TabListResponse>, ApiError> {
    let manager = &state.session_manager;
    match query.group {
        Some(raw) => {
            let group = parse_group(&raw)
                .ok_or((StatusCode::BAD_REQUEST, format!("Invalid group: {}", raw)))?;
            Ok(Json(TabListResponse {
                tabs: manager.tabs(&group).await,
                active: manager.active_tab(&group).await,
            }))
        }
        None => Ok(Json(TabListResponse {
            tabs: manager.all_tabs().await,
            active: None,
        })),
    }
}

#[derive(Deserialize)]
pub struct CreateTabRequest {
    pub title: String,
    #[serde(default)]
    pub kind: TabKind,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default = "default_true")]
    pub closable: bool,
    #[serde(default)]
    pub group: TabGroup,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Activate (and connect) the tab right away.
    #[serde(default)]
    pub activate: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
pub struct CreateTabResponse {
    pub tab_id: Uuid,
    pub ws_url: String,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTabRequest>,
) -> Result<Json<CreateTabResponse>, ApiError> {
    let spec = TabSpec {
        title: req.title,
        kind: req.kind,
        working_directory: req
            .working_directory
            .unwrap_or_else(|| state.config.default_working_directory.clone()),
        shell: req.shell.unwrap_or_else(|| state.config.shell()),
        icon: req.icon,
        closable: req.closable,
        group: req.group,
        environment: req.environment,
    };

    let manager = &state.session_manager;
    let tab_id = manager.create_tab(spec).await.map_err(error_response)?;
    if req.activate {
        manager.set_active_tab(tab_id).await.map_err(error_response)?;
    }

    info!(target: "tabterm::api", "Tab {} created", tab_id);
    Ok(Json(CreateTabResponse {
        tab_id,
        ws_url: format!("/ws/tabs/{}", tab_id),
    }))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Tab>, ApiError> {
    state
        .session_manager
        .tab(id)
        .await
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "Tab not found".to_string()))
}

/// Close a tab and kill its process. Closing twice is not an error; a tab
/// created with `closable: false` is refused.
pub async fn close(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .session_manager
        .close_tab(id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct RenameTabRequest {
    pub title: String,
}

pub async fn rename(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameTabRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .session_manager
        .rename_tab(id, &req.title)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::OK)
}

pub async fn activate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let manager = &state.session_manager;
    if manager.tab(id).await.is_none() {
        return Err((StatusCode::NOT_FOUND, "Tab not found".to_string()));
    }
    manager.set_active_tab(id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ReorderRequest {
    #[serde(default)]
    pub group: TabGroup,
    pub from: usize,
    pub to: usize,
}

pub async fn reorder(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReorderRequest>,
) -> Result<StatusCode, ApiError> {
    if state
        .session_manager
        .reorder_tabs(&req.group, req.from, req.to)
        .await
    {
        Ok(StatusCode::OK)
    } else {
        Err((
            StatusCode::BAD_REQUEST,
            format!("Cannot move tab {} to {} in {}", req.from, req.to, req.group),
        ))
    }
}

#[derive(Serialize)]
pub struct ConnectionResponse {
    pub connection: ConnectionState,
}

pub async fn retry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let connection = state
        .session_manager
        .retry_connection(id)
        .await
        .map_err(error_response)?;
    Ok(Json(ConnectionResponse { connection }))
}

#[derive(Deserialize)]
pub struct SendInputRequest {
    pub data: String,
}

pub async fn send_input(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendInputRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .session_manager
        .send_input(id, req.data.as_bytes())
        .await
        .map_err(error_response)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
pub struct QuickCommandRequest {
    pub text: String,
}

pub async fn quick_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<QuickCommandRequest>,
) -> Result<StatusCode, ApiError> {
    if req.text.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Empty command".to_string()));
    }
    state
        .session_manager
        .execute_quick_command(id, &req.text)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<CommandHistoryEntry>>, ApiError> {
    if state.session_manager.tab(id).await.is_none() {
        return Err((StatusCode::NOT_FOUND, "Tab not found".to_string()));
    }
    Ok(Json(state.session_manager.history(id)))
}

pub async fn clear_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .session_manager
        .clear_history(id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn counts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<OutputClassification>, ApiError> {
    state
        .session_manager
        .output_classification(id)
        .await
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "Tab not found".to_string()))
}

pub async fn overview(State(state): State<Arc<AppState>>) -> Json<SessionOverview> {
    Json(state.session_manager.overview().await)
}
