//! HTTP API over the task board

use axum::{
    Json, Router,
    extract::{Path, Query, RawQuery, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::board::{Board, BoardError, BulkPatch};
use crate::export::{self, ExportOptions, Format};
use crate::migration;
use crate::models::{NewTask, Priority, Task, TaskPatch, TaskStatus};
use crate::query::{self, SortField, SortSpec};
use crate::recycle_bin::PendingDeletion;
use crate::settings::{AppSettings, Language, LastUsedFilters, SettingsError, Theme};
use crate::storage::{StorageError, StorageErrorKind, TASKS_KEY};
use crate::view_params::{ViewParams, ViewParamsError};

const CHANGES_POLL_TIMEOUT: Duration = Duration::from_secs(25);

/// Application state shared across handlers
pub struct AppState {
    pub board: Arc<Board>,
}

impl AppState {
    pub fn new(board: Arc<Board>) -> Arc<Self> {
        Arc::new(Self { board })
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/taskboard/v1/tasks", get(raw_tasks))
        .route("/taskboard/v1/users", get(users))
        .route("/api/v1/tasks", get(list_tasks).post(create_task))
        .route("/api/v1/tasks/bulk", post(bulk))
        .route("/api/v1/tasks/overdue", get(overdue_tasks))
        .route(
            "/api/v1/tasks/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/api/v1/tasks/{id}/status", post(change_status))
        .route("/api/v1/recycle-bin", get(recycle_bin).delete(empty_recycle_bin))
        .route("/api/v1/recycle-bin/changes", get(recycle_bin_changes))
        .route("/api/v1/recycle-bin/{id}/restore", post(restore_task))
        .route(
            "/api/v1/settings",
            get(get_settings).put(put_settings).patch(patch_settings),
        )
        .route("/api/v1/settings/sort/{field}", post(toggle_sort))
        .route("/api/v1/settings/filters", delete(clear_filters))
        .route("/api/v1/settings/export", get(export_settings))
        .route("/api/v1/settings/import", post(import_settings))
        .route("/api/v1/settings/reset", post(reset_settings))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/export", get(export_tasks))
        .route("/api/v1/presence", get(presence))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskboard",
        "version": env!("CARGO_PKG_VERSION"),
        "session": state.board.session_id(),
        "schema_version": migration::stored_version(state.board.storage()).ok(),
        "storage_available": state.board.storage().is_available(),
    }))
}

/// Stored task array exactly as persisted, after pending saves land
async fn raw_tasks(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Task>>, ApiError> {
    state.board.flush().await;
    let tasks = state
        .board
        .storage()
        .get_json::<Vec<Task>>(TASKS_KEY)?
        .unwrap_or_default();
    Ok(Json(tasks))
}

async fn users(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.board.users()?))
}

/// Filtered, sorted page described by the URL query
async fn list_tasks(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Result<impl IntoResponse, ApiError> {
    let view = ViewParams::parse(query.as_deref().unwrap_or_default())?;
    let page = state.board.query(&view, Utc::now());

    state.board.remember_filters(LastUsedFilters {
        filter: view.filter.clone(),
        advanced: view.advanced.clone(),
    });

    tracing::debug!(
        total = page.total_items,
        page = page.page,
        page_size = page.page_size,
        "Task list served"
    );

    Ok(Json(serde_json::json!({
        "items": page.items,
        "total_items": page.total_items,
        "page": page.page,
        "page_size": page.page_size,
        "total_pages": page.total_pages,
        "view": view.to_query_string(),
        "warning": state.board.last_warning(),
    })))
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewTask>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.board.create(new)?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.board.get(&id)?))
}

/// Open tasks past their due date, with how many days late each one is
async fn overdue_tasks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = Utc::now();
    let items: Vec<serde_json::Value> = state
        .board
        .overdue(now)
        .into_iter()
        .map(|task| {
            let days_overdue = query::days_until_due(&task, now).map(|days| -days);
            serde_json::json!({ "task": task, "days_overdue": days_overdue })
        })
        .collect();
    Json(serde_json::json!({ "total": items.len(), "items": items }))
}

async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.board.update(&id, patch)?))
}

#[derive(Debug, Default, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    permanent: bool,
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<impl IntoResponse, ApiError> {
    if params.permanent {
        let task = state.board.delete(&id)?;
        return Ok(Json(serde_json::json!({ "deleted": task, "undo_ms": 0 })));
    }

    let task = state.board.delete_with_undo(&id)?;
    let bin = state.board.recycle_bin();
    Ok(Json(serde_json::json!({
        "deleted": task,
        "undo_ms": bin.remaining(&id).as_millis() as u64,
        "undo_available": bin.is_pending(&id),
    })))
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StatusMode {
    /// Drag-and-drop
    #[default]
    Move,
    /// Quick status button
    Transition,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StatusChange {
    status: TaskStatus,
    #[serde(default)]
    mode: StatusMode,
}

async fn change_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(change): Json<StatusChange>,
) -> Result<Json<Task>, ApiError> {
    let task = match change.mode {
        StatusMode::Move => state.board.move_to(&id, change.status)?,
        StatusMode::Transition => state.board.transition(&id, change.status)?,
    };
    Ok(Json(task))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BulkAction {
    Update,
    Delete,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BulkRequest {
    ids: Vec<String>,
    action: BulkAction,
    #[serde(default)]
    status: Option<TaskStatus>,
    #[serde(default)]
    priority: Option<Priority>,
}

async fn bulk(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BulkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = match request.action {
        BulkAction::Update => {
            let patch = BulkPatch {
                status: request.status,
                priority: request.priority,
            };
            state.board.bulk_update(&request.ids, &patch)?
        }
        BulkAction::Delete => state.board.bulk_delete(&request.ids)?,
    };
    Ok(Json(serde_json::json!({
        "affected": tasks.len(),
        "tasks": tasks,
    })))
}

async fn recycle_bin(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let bin = state.board.recycle_bin();
    Json(serde_json::json!({
        "items": bin.pending(),
        "stats": bin.stats(),
        "window_ms": bin.window().as_millis() as u64,
    }))
}

/// Long poll for undo affordances: answers as soon as the pending list changes
async fn recycle_bin_changes(State(state): State<Arc<AppState>>) -> Json<Vec<PendingDeletion>> {
    let mut updates = state.board.recycle_bin().subscribe();
    if tokio::time::timeout(CHANGES_POLL_TIMEOUT, updates.changed())
        .await
        .is_err()
    {
        tracing::trace!("Recycle bin poll timed out");
    }
    let pending = updates.borrow().clone();
    Json(pending)
}

async fn restore_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.board.restore(&id)?))
}

async fn empty_recycle_bin(State(state): State<Arc<AppState>>) -> StatusCode {
    state.board.recycle_bin().clear_all();
    StatusCode::NO_CONTENT
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<AppSettings> {
    Json(state.board.settings().get())
}

async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<AppSettings>,
) -> Result<Json<AppSettings>, ApiError> {
    Ok(Json(state.board.settings().replace(settings)?))
}

/// Fields that can be changed one at a time; the rest of the settings stay as they are
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
struct SettingsPatch {
    page_size: Option<usize>,
    sort: Option<SortSpec>,
    theme: Option<Theme>,
    language: Option<Language>,
}

async fn patch_settings(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<AppSettings>, ApiError> {
    let settings = state.board.settings();
    if let Some(page_size) = patch.page_size {
        settings.update_page_size(page_size)?;
    }
    if let Some(sort) = patch.sort {
        settings.update_sort(sort);
    }
    if let Some(theme) = patch.theme {
        settings.update_theme(theme);
    }
    if let Some(language) = patch.language {
        settings.update_language(language);
    }
    Ok(Json(settings.get()))
}

/// Column header click: same field flips direction, a new field starts ascending
async fn toggle_sort(
    State(state): State<Arc<AppState>>,
    Path(field): Path<String>,
) -> Result<Json<SortSpec>, ApiError> {
    let field =
        SortField::parse(&field).ok_or_else(|| ViewParamsError::SortField(field.clone()))?;
    let settings = state.board.settings();
    let sort = settings.sort().toggle(field);
    Ok(Json(settings.update_sort(sort).sort))
}

async fn clear_filters(State(state): State<Arc<AppState>>) -> Json<AppSettings> {
    Json(state.board.settings().clear_last_used_filters())
}

async fn export_settings(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let json = state.board.settings().export_json()?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"taskboard-settings.json\"",
            ),
        ],
        json,
    )
        .into_response())
}

async fn import_settings(State(state): State<Arc<AppState>>, body: String) -> Response {
    let settings = state.board.settings();
    if settings.import_json(&body) {
        Json(settings.get()).into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "settings import rejected" })),
        )
            .into_response()
    }
}

async fn reset_settings(State(state): State<Arc<AppState>>) -> Json<AppSettings> {
    Json(state.board.settings().reset_to_defaults())
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let tasks = state.board.tasks();
    let users = state.board.users().unwrap_or_default();
    let by_assignee: Vec<serde_json::Value> = query::group_by_assignee(&tasks)
        .into_iter()
        .map(|(assignee, group)| {
            let name = users
                .iter()
                .find(|u| u.id == assignee)
                .map(|u| (u.display_name(), u.initials()))
                .unwrap_or_else(|| (assignee.clone(), String::new()));
            serde_json::json!({
                "assignee": assignee,
                "name": name.0,
                "initials": name.1,
                "count": group.len(),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "tasks": state.board.stats(now),
        "columns": state.board.column_stats(now),
        "by_assignee": by_assignee,
        "storage": state.board.storage_info()?,
        "warning": state.board.last_warning(),
    })))
}

#[derive(Debug, Error)]
#[error("unsupported export format: {0}")]
struct UnsupportedFormat(String);

#[derive(Debug, Deserialize)]
struct ExportParams {
    #[serde(default)]
    format: Option<String>,
}

async fn export_tasks(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExportParams>,
) -> Result<Response, ApiError> {
    let requested = params.format.unwrap_or_else(|| "csv".to_string());
    let format = Format::parse(&requested).ok_or(UnsupportedFormat(requested))?;

    let now = Utc::now();
    let mut tasks = state.board.tasks();
    query::sort_tasks(&mut tasks, state.board.settings().sort());
    let body = export::render(&tasks, format, &ExportOptions::default(), now);
    let disposition = format!(
        "attachment; filename=\"{}\"",
        export::filename("tasks", format, now)
    );

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn presence(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let presence = state.board.presence();
    Ok(Json(serde_json::json!({
        "session_id": presence.session_id(),
        "active": presence.active_sessions()?,
        "only_active": presence.is_only_active()?,
    })))
}

/// API error type
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        if let Some(err) = self.0.downcast_ref::<BoardError>() {
            return match err {
                BoardError::Validation(_) => StatusCode::BAD_REQUEST,
                BoardError::NotFound(_) => StatusCode::NOT_FOUND,
                BoardError::InvalidTransition { .. } => StatusCode::CONFLICT,
                BoardError::Storage(e) => storage_status(e),
            };
        }
        if let Some(e) = self.0.downcast_ref::<StorageError>() {
            return storage_status(e);
        }
        if self.0.is::<SettingsError>()
            || self.0.is::<ViewParamsError>()
            || self.0.is::<UnsupportedFormat>()
        {
            return StatusCode::BAD_REQUEST;
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn storage_status(err: &StorageError) -> StatusCode {
    match err.kind() {
        StorageErrorKind::QuotaExceeded => StatusCode::INSUFFICIENT_STORAGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "API error");
        } else {
            tracing::debug!(status = %status, error = %self.0, "Request rejected");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::{DEFAULT_QUOTA_BYTES, Storage};
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn app() -> (Router, Arc<Board>) {
        let store = Arc::new(Storage::open_in_memory(DEFAULT_QUOTA_BYTES, "session_api").unwrap());
        let board = Board::open(store, &Config::default());
        (create_router(AppState::new(Arc::clone(&board))), board)
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let (status, body) = send(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["session"], "session_api");
    }

    #[tokio::test]
    async fn test_create_list_and_get() {
        let (app, _) = app();
        let (status, created) = send(
            &app,
            Method::POST,
            "/api/v1/tasks",
            Some(serde_json::json!({ "title": "Fix bug", "priority": "high", "tags": ["ui"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();

        send(
            &app,
            Method::POST,
            "/api/v1/tasks",
            Some(serde_json::json!({ "title": "Write docs" })),
        )
        .await;

        let (status, page) = send(&app, Method::GET, "/api/v1/tasks?search=bug&size=10", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total_items"], 1);
        assert_eq!(page["items"][0]["id"], id.as_str());
        assert_eq!(page["page_size"], 10);

        let (status, task) = send(&app, Method::GET, &format!("/api/v1/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(task["title"], "Fix bug");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (app, board) = app();
        let (status, _) = send(
            &app,
            Method::POST,
            "/api/v1/tasks",
            Some(serde_json::json!({ "title": "no" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::GET, "/api/v1/tasks/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, Method::GET, "/api/v1/tasks?size=0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let task = board
            .create(NewTask {
                title: "Workflow".into(),
                ..NewTask::default()
            })
            .unwrap();
        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/api/v1/tasks/{}/status", task.id),
            Some(serde_json::json!({ "status": "finished", "mode": "transition" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, moved) = send(
            &app,
            Method::POST,
            &format!("/api/v1/tasks/{}/status", task.id),
            Some(serde_json::json!({ "status": "finished" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(moved["status"], "finished");

        let (status, _) = send(&app, Method::GET, "/api/v1/export?format=xml", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_restore_through_recycle_bin() {
        let (app, board) = app();
        let task = board
            .create(NewTask {
                title: "Undo me".into(),
                ..NewTask::default()
            })
            .unwrap();

        let (status, deleted) =
            send(&app, Method::DELETE, &format!("/api/v1/tasks/{}", task.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(deleted["undo_ms"].as_u64().unwrap() > 0);

        let (_, bin) = send(&app, Method::GET, "/api/v1/recycle-bin", None).await;
        assert_eq!(bin["items"][0]["task_id"], task.id.as_str());

        let (status, restored) = send(
            &app,
            Method::POST,
            &format!("/api/v1/recycle-bin/{}/restore", task.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(restored["id"], task.id.as_str());

        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/api/v1/recycle-bin/{}/restore", task.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            Method::DELETE,
            &format!("/api/v1/tasks/{}?permanent=true", task.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(board.recycle_bin().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_update_and_delete() {
        let (app, board) = app();
        let ids: Vec<String> = ["One task", "Two task"]
            .into_iter()
            .map(|title| {
                board
                    .create(NewTask {
                        title: title.into(),
                        ..NewTask::default()
                    })
                    .unwrap()
                    .id
            })
            .collect();

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/tasks/bulk",
            Some(serde_json::json!({ "ids": ids, "action": "update", "priority": "urgent" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["affected"], 2);

        let (_, body) = send(
            &app,
            Method::POST,
            "/api/v1/tasks/bulk",
            Some(serde_json::json!({ "ids": ids, "action": "delete" })),
        )
        .await;
        assert_eq!(body["affected"], 2);
        assert!(board.tasks().is_empty());
        assert_eq!(board.recycle_bin().len(), 2);
    }

    #[tokio::test]
    async fn test_settings_roundtrip_and_validation() {
        let (app, _) = app();
        let (_, mut settings) = send(&app, Method::GET, "/api/v1/settings", None).await;
        assert_eq!(settings["pageSize"], 20);

        settings["pageSize"] = serde_json::json!(50);
        let (status, updated) =
            send(&app, Method::PUT, "/api/v1/settings", Some(settings.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["pageSize"], 50);

        settings["pageSize"] = serde_json::json!(15);
        let (status, _) = send(&app, Method::PUT, "/api/v1/settings", Some(settings)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_users_stats_presence_and_export() {
        let (app, board) = app();
        board
            .create(NewTask {
                title: "Exported".into(),
                ..NewTask::default()
            })
            .unwrap();

        let (_, users) = send(&app, Method::GET, "/taskboard/v1/users", None).await;
        assert_eq!(users.as_array().unwrap().len(), 5);

        let (_, stats) = send(&app, Method::GET, "/api/v1/stats", None).await;
        assert_eq!(stats["tasks"]["total"], 1);
        assert_eq!(stats["by_assignee"][0]["assignee"], "unassigned");
        assert_eq!(stats["by_assignee"][0]["count"], 1);

        let (_, presence) = send(&app, Method::GET, "/api/v1/presence", None).await;
        assert_eq!(presence["only_active"], true);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/export?format=markdown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_DISPOSITION]
                .to_str()
                .unwrap()
                .ends_with(".md\"")
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("Exported"));
    }

    #[tokio::test]
    async fn test_settings_patch_toggle_and_reset() {
        let (app, _) = app();
        let (status, patched) = send(
            &app,
            Method::PATCH,
            "/api/v1/settings",
            Some(serde_json::json!({ "pageSize": 10, "theme": "dark" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["pageSize"], 10);
        assert_eq!(patched["theme"], "dark");
        assert_eq!(patched["language"], "uz");

        let (status, _) = send(
            &app,
            Method::PATCH,
            "/api/v1/settings",
            Some(serde_json::json!({ "pageSize": 30 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, sort) = send(&app, Method::POST, "/api/v1/settings/sort/title", None).await;
        assert_eq!(sort, serde_json::json!({ "by": "title", "dir": "asc" }));
        let (_, sort) = send(&app, Method::POST, "/api/v1/settings/sort/title", None).await;
        assert_eq!(sort["dir"], "desc");
        let (status, _) = send(&app, Method::POST, "/api/v1/settings/sort/colour", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, reset) = send(&app, Method::POST, "/api/v1/settings/reset", None).await;
        assert_eq!(reset["pageSize"], 20);
        assert_eq!(reset["theme"], "light");
    }

    #[tokio::test]
    async fn test_settings_export_then_import() {
        let (app, board) = app();
        board.settings().update_page_size(50).unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/settings/export")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let exported = to_bytes(response.into_body(), usize::MAX).await.unwrap();

        board.settings().reset_to_defaults();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/v1/settings/import")
                    .body(Body::from(exported))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(board.settings().page_size(), 50);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/v1/settings/import")
                    .body(Body::from("not settings"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(board.settings().page_size(), 50);
    }

    #[tokio::test]
    async fn test_overdue_endpoint_reports_days_late() {
        let (app, board) = app();
        board
            .create(NewTask {
                title: "Long overdue".into(),
                due_date: Some("2020-01-01".into()),
                ..NewTask::default()
            })
            .unwrap();
        board
            .create(NewTask {
                title: "Not due yet".into(),
                due_date: Some("2999-01-01".into()),
                ..NewTask::default()
            })
            .unwrap();

        let (status, body) = send(&app, Method::GET, "/api/v1/tasks/overdue", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["items"][0]["task"]["title"], "Long overdue");
        assert!(body["items"][0]["days_overdue"].as_i64().unwrap() > 365);
    }

    #[tokio::test]
    async fn test_recycle_bin_long_poll_sees_delete() {
        let (app, board) = app();
        let task = board
            .create(NewTask {
                title: "Watched task".into(),
                ..NewTask::default()
            })
            .unwrap();

        let poll = send(&app, Method::GET, "/api/v1/recycle-bin/changes", None);
        let delete = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            board.delete_with_undo(&task.id).unwrap();
        };
        let ((status, pending), ()) = tokio::join!(poll, delete);

        assert_eq!(status, StatusCode::OK);
        assert_eq!(pending[0]["task_id"], task.id.as_str());
    }

    #[tokio::test]
    async fn test_raw_tasks_reflect_storage() {
        let (app, board) = app();
        board
            .create(NewTask {
                title: "Persisted".into(),
                ..NewTask::default()
            })
            .unwrap();

        let (status, raw) = send(&app, Method::GET, "/taskboard/v1/tasks", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(raw[0]["title"], "Persisted");
    }
}
