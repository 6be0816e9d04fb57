use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use application::manager::DeviceQuery;
use domain::device::{BindingConfig, BindingProtocol};
use domain::error::EngineError;
use domain::group::{DropoutConfig, LaunchConfig};
use domain::model::DeviceModel;

use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/models", get(list_models).post(create_model))
        .route("/api/v1/models/{id}", get(get_model).delete(delete_model))
        .route("/api/v1/devices", get(list_devices).post(create_device))
        .route("/api/v1/devices/{id}", get(get_device).delete(delete_device))
        .route("/api/v1/devices/{id}/start", post(start_device))
        .route("/api/v1/devices/{id}/stop", post(stop_device))
        .route("/api/v1/devices/{id}/metrics", get(device_metrics))
        .route("/api/v1/devices/{id}/bind", post(bind_device))
        .route("/api/v1/devices/{id}/unbind", post(unbind_device))
        .route("/api/v1/devices/{id}/binding", get(get_binding))
        .route("/api/v1/groups", get(list_groups).post(create_group))
        .route("/api/v1/groups/{id}", get(get_group).delete(delete_group))
        .route("/api/v1/groups/{id}/start", post(start_group))
        .route("/api/v1/groups/{id}/stop", post(stop_group))
        .route("/api/v1/groups/{id}/dropout", post(dropout_group))
        .route("/api/v1/webhooks/{id}", post(ingest_webhook))
        .route("/api/v1/stats", get(get_stats))
        .layer(cors)
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
        .with_state(state)
}

/// Typed error responses: `{error, code}` bodies with 400/404/409/500.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::AlreadyExists(_) | EngineError::Conflict(_) | EngineError::Busy(_) => {
                StatusCode::CONFLICT
            }
            EngineError::Unavailable(_)
            | EngineError::Timeout(_)
            | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({"error": self.0.to_string(), "code": self.0.code()});
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn bad_body(rejection: JsonRejection) -> ApiError {
    ApiError(EngineError::Validation(rejection.body_text()))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ----------------------------------------------------------------------
// Models

async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.list_models().await)
}

async fn create_model(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DeviceModel>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(model) = body.map_err(bad_body)?;
    let (model, created) = state.manager.register_model(model).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(model)).into_response())
}

async fn get_model(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.get_model(&id).await?))
}

async fn delete_model(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    state.manager.delete_model(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ----------------------------------------------------------------------
// Devices

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDeviceRequest {
    model_id: String,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    group_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DeviceListQuery {
    model_id: Option<String>,
    group_id: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeviceListQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(EngineError::Validation)?;
    let devices = state
        .manager
        .list_devices(&DeviceQuery {
            model_id: query.model_id,
            group_id: query.group_id,
            status,
            limit: query.limit,
            offset: query.offset,
        })
        .await;
    Ok(Json(devices))
}

async fn create_device(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateDeviceRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body.map_err(bad_body)?;
    let device = state
        .manager
        .create_device(&req.model_id, req.device_id, req.group_id)
        .await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn get_device(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.get_device(&id).await?))
}

async fn delete_device(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    state.manager.delete_device(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_device(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let device = state.manager.start_device(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(device)))
}

async fn stop_device(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let device = state.manager.stop_device(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(device)))
}

async fn device_metrics(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.device_metrics(&id).await?))
}

// ----------------------------------------------------------------------
// Groups

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupRequest {
    model_id: String,
    count: usize,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    id_pattern: Option<String>,
}

async fn list_groups(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.list_groups().await)
}

async fn create_group(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateGroupRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body.map_err(bad_body)?;
    let group = state
        .manager
        .create_group(&req.model_id, req.count, req.group_id, req.id_pattern)
        .await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn get_group(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.get_group(&id).await?))
}

async fn delete_group(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    state.manager.delete_group(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_group(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    body: Result<Json<LaunchConfig>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(config) = body.map_err(bad_body)?;
    let accepted = state.manager.start_group(&id, config).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn stop_group(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    state.manager.stop_group(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"status": "stopping"}))))
}

async fn dropout_group(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    body: Result<Json<DropoutConfig>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(config) = body.map_err(bad_body)?;
    let accepted = state.manager.dropout_group(&id, config).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

// ----------------------------------------------------------------------
// Proxy bindings & webhook ingress

async fn bind_device(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    body: Result<Json<BindingConfig>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(config) = body.map_err(bad_body)?;
    let binding = state.manager.bind_device(&id, config).await?;
    let mut response = json!({"status": "bound"});
    if binding.protocol == BindingProtocol::Http {
        response["webhookUrl"] = json!(binding.webhook_path);
    }
    Ok(Json(response))
}

async fn unbind_device(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    state.manager.unbind_device(&id).await?;
    Ok(Json(json!({"status": "unbound"})))
}

async fn get_binding(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.get_binding(&id).await?))
}

/// The sole runtime-dispatched ingress route: external sources POST here
/// for bound HTTP proxy devices.
async fn ingest_webhook(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(payload) = body.map_err(bad_body)?;
    state.manager.ingest_webhook(&id, &payload).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))))
}

// ----------------------------------------------------------------------
// Engine

async fn get_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.stats().await)
}
