use crate::config::{AppConfig, FieldOptions, GroupOptions};
use crate::error::{VizError, VizResult};
use crate::types::{ClassBreakResult, EnumUnitRecord, Level};
use crate::viz::VizEngine;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

/// Created once at start-up and shared by every handler.
pub struct AppState {
    pub engine: VizEngine,
    pub config: AppConfig,
}

/// A group given inline, or by its name in the configuration.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum GroupRef {
    Named(String),
    Inline(GroupOptions),
}

#[derive(Debug, Deserialize)]
pub struct VizRequest {
    pub level: Level,
    #[serde(flatten)]
    pub body: RollUpRequest,
}

#[derive(Debug, Deserialize)]
pub struct RollUpRequest {
    pub group: GroupRef,
    pub fields: Vec<FieldOptions>,
    #[serde(alias = "classCount")]
    pub class_count: Option<usize>,
    #[serde(alias = "classMethod")]
    pub class_method: Option<String>,
}

#[derive(Deserialize)]
pub struct IdentityQuery {
    identity: String,
}

#[derive(Serialize)]
pub struct ExistsResponse {
    exists: bool,
}

pub struct ApiError(VizError);

impl From<VizError> for ApiError {
    fn from(e: VizError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            VizError::InvalidRequest(_) | VizError::UnsupportedClassification(_) => StatusCode::BAD_REQUEST,
            VizError::InsufficientData(_) => StatusCode::UNPROCESSABLE_ENTITY,
            VizError::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        warn!(error = %self.0, "Visualization request failed");
        let body = Json(json!({ "error": self.0.kind(), "message": self.0.to_string() }));
        (status, body).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/api/viz", post(viz_handler))
        .route("/api/viz/rollup", post(rollup_handler))
        .route("/api/units/{level}/{geoid}", get(unit_handler))
        .route("/api/units/{level}", delete(reset_handler))
        .route("/api/fields/{level}", get(field_exists_handler));

    if let Some(static_dir) = &state.config.server.static_dir {
        app = app.fallback_service(ServeDir::new(static_dir));
    }

    app.layer(CorsLayer::permissive()).with_state(state)
}

pub async fn start_server(config: AppConfig, engine: VizEngine) -> Result<()> {
    let port = config.server.port;
    let state = Arc::new(AppState { engine, config });

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

impl AppState {
    fn resolve_group(&self, group: GroupRef) -> VizResult<GroupOptions> {
        match group {
            GroupRef::Named(name) => self.config.group(&name).cloned(),
            GroupRef::Inline(group) => Ok(group),
        }
    }

    fn class_settings(&self, req: &RollUpRequest) -> (usize, String) {
        let defaults = &self.config.classification;
        (
            req.class_count.unwrap_or(defaults.class_count),
            req.class_method.clone().unwrap_or_else(|| defaults.method.clone()),
        )
    }
}

async fn viz_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VizRequest>,
) -> Result<Json<Vec<ClassBreakResult>>, ApiError> {
    let (class_count, method) = state.class_settings(&req.body);
    let group = state.resolve_group(req.body.group)?;
    let results = state
        .engine
        .update_viz(req.level, &group, &req.body.fields, class_count, &method)
        .await?;
    Ok(Json(results))
}

async fn rollup_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RollUpRequest>,
) -> Result<Json<Vec<ClassBreakResult>>, ApiError> {
    let (class_count, method) = state.class_settings(&req);
    let group = state.resolve_group(req.group)?;
    let results = state
        .engine
        .update_viz_rolled_up(&group, &req.fields, class_count, &method)
        .await?;
    Ok(Json(results))
}

async fn unit_handler(
    State(state): State<Arc<AppState>>,
    Path((level, geoid)): Path<(String, String)>,
) -> Result<Json<Option<EnumUnitRecord>>, ApiError> {
    let level: Level = level.parse()?;
    Ok(Json(state.engine.record(level, &geoid).await))
}

async fn field_exists_handler(
    State(state): State<Arc<AppState>>,
    Path(level): Path<String>,
    Query(params): Query<IdentityQuery>,
) -> Result<Json<ExistsResponse>, ApiError> {
    let level: Level = level.parse()?;
    Ok(Json(ExistsResponse {
        exists: state.engine.field_exists(level, &params.identity).await,
    }))
}

async fn reset_handler(
    State(state): State<Arc<AppState>>,
    Path(level): Path<String>,
) -> Result<StatusCode, ApiError> {
    let level: Level = level.parse()?;
    state.engine.reset(level).await;
    Ok(StatusCode::NO_CONTENT)
}
