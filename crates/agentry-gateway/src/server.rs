//! HTTP control plane: hub, per-agency and per-agent endpoints over axum.

use crate::auth::ResolvedAuth;
use agentry_core::protocol::{
    Ack, ActionBody, AgentList, ChildResultBody, EventLog, InvokeAck, InvokeBody,
};
use agentry_core::{Blueprint, Error, OverlapPolicy, Schedule, ScheduleStatus, ScheduleType};
use agentry_runtime::{Agency, AgentHandle, Hub};
use axum::extract::{Path, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub auth: ResolvedAuth,
}

/// Error mapping per the hub taxonomy: validation 400, auth 401, missing
/// 404, duplicates 409, everything else 500.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) | Error::JsonError(_) => StatusCode::BAD_REQUEST,
            Error::AuthFailed { .. } => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agencies", get(list_agencies).post(create_agency))
        .route("/agencies/{agency}", delete(delete_agency))
        .route(
            "/agencies/{agency}/blueprints",
            get(list_blueprints).post(put_blueprint),
        )
        .route(
            "/agencies/{agency}/blueprints/{name}",
            delete(delete_blueprint),
        )
        .route(
            "/agencies/{agency}/internal/blueprint/{name}",
            get(get_blueprint),
        )
        .route("/agencies/{agency}/agents", get(list_agents).post(spawn_agent))
        .route("/agencies/{agency}/agents/{id}", delete(delete_agent))
        .route(
            "/agencies/{agency}/agents/{id}/register",
            post(register_agent),
        )
        .route("/agencies/{agency}/agents/{id}/invoke", post(invoke_agent))
        .route("/agencies/{agency}/agents/{id}/action", post(agent_action))
        .route("/agencies/{agency}/agents/{id}/cancel", post(cancel_agent))
        .route("/agencies/{agency}/agents/{id}/state", get(agent_state))
        .route("/agencies/{agency}/agents/{id}/events", get(agent_events))
        .route(
            "/agencies/{agency}/agents/{id}/child_result",
            post(child_result),
        )
        .route("/agencies/{agency}/vars", get(list_vars).put(put_vars))
        .route(
            "/agencies/{agency}/vars/{key}",
            get(get_var).put(put_var).delete(delete_var),
        )
        .route(
            "/agencies/{agency}/schedules",
            get(list_schedules).post(create_schedule),
        )
        .route(
            "/agencies/{agency}/schedules/{id}",
            get(get_schedule).patch(patch_schedule).delete(delete_schedule),
        )
        .route(
            "/agencies/{agency}/schedules/{id}/pause",
            post(pause_schedule),
        )
        .route(
            "/agencies/{agency}/schedules/{id}/resume",
            post(resume_schedule),
        )
        .route(
            "/agencies/{agency}/schedules/{id}/trigger",
            post(trigger_schedule),
        )
        .route("/agencies/{agency}/schedules/{id}/runs", get(schedule_runs))
        .layer(middleware::from_fn_with_state(state.clone(), check_secret))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

pub async fn serve(hub: Hub, auth: ResolvedAuth, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(AppState { hub, auth });
    info!("Agentry hub v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn check_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    // Preflight never needs the secret; the CORS layer answers it.
    if request.method() == Method::OPTIONS || request.uri().path() == "/health" {
        return next.run(request).await;
    }
    let provided = request
        .headers()
        .get("x-secret")
        .and_then(|v| v.to_str().ok());
    match state.auth.verify(provided) {
        Ok(()) => next.run(request).await,
        Err(e) => ApiError(e).into_response(),
    }
}

// -- hub ---------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "agencies": state.hub.list_agencies().map(|a| a.len()).unwrap_or(0),
    }))
}

#[derive(Deserialize)]
struct CreateAgencyBody {
    name: String,
}

async fn list_agencies(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.hub.list_agencies()?))
}

async fn create_agency(
    State(state): State<AppState>,
    Json(body): Json<CreateAgencyBody>,
) -> ApiResult<impl IntoResponse> {
    let agency = state.hub.create_agency(&body.name)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "name": agency.name() })),
    ))
}

async fn delete_agency(
    State(state): State<AppState>,
    Path(agency): Path<String>,
) -> ApiResult<Json<Ack>> {
    state.hub.delete_agency(&agency).await?;
    Ok(Json(Ack::ok()))
}

fn agency(state: &AppState, name: &str) -> Result<Agency, Error> {
    state.hub.require_agency(name)
}

fn agent(state: &AppState, agency_name: &str, id: &str) -> Result<(Agency, AgentHandle), Error> {
    let agency = agency(state, agency_name)?;
    let handle = agency
        .agent(id)
        .ok_or_else(|| Error::not_found(format!("agent '{id}'")))?;
    Ok((agency, handle))
}

// -- blueprints --------------------------------------------------------------

async fn list_blueprints(
    State(state): State<AppState>,
    Path(agency_name): Path<String>,
) -> ApiResult<Json<Vec<Blueprint>>> {
    Ok(Json(agency(&state, &agency_name)?.catalog().list_blueprints()?))
}

async fn put_blueprint(
    State(state): State<AppState>,
    Path(agency_name): Path<String>,
    Json(blueprint): Json<Blueprint>,
) -> ApiResult<Json<Blueprint>> {
    Ok(Json(
        agency(&state, &agency_name)?.catalog().put_blueprint(blueprint)?,
    ))
}

async fn delete_blueprint(
    State(state): State<AppState>,
    Path((agency_name, name)): Path<(String, String)>,
) -> ApiResult<Json<Ack>> {
    let removed = agency(&state, &agency_name)?.catalog().delete_blueprint(&name)?;
    if !removed {
        return Err(Error::not_found(format!("blueprint '{name}'")).into());
    }
    Ok(Json(Ack::ok()))
}

/// Children resolving their type read the live catalogue here.
async fn get_blueprint(
    State(state): State<AppState>,
    Path((agency_name, name)): Path<(String, String)>,
) -> ApiResult<Json<Blueprint>> {
    let blueprint = agency(&state, &agency_name)?
        .catalog()
        .get_blueprint(&name)?
        .ok_or_else(|| Error::not_found(format!("blueprint '{name}'")))?;
    Ok(Json(blueprint))
}

// -- agents ------------------------------------------------------------------

#[derive(Deserialize)]
struct SpawnBody {
    #[serde(rename = "agentType")]
    agent_type: String,
    #[serde(default)]
    input: Option<InvokeBody>,
}

async fn list_agents(
    State(state): State<AppState>,
    Path(agency_name): Path<String>,
) -> ApiResult<Json<AgentList>> {
    let agents = agency(&state, &agency_name)?.list_agents()?;
    Ok(Json(AgentList { agents }))
}

async fn spawn_agent(
    State(state): State<AppState>,
    Path(agency_name): Path<String>,
    Json(body): Json<SpawnBody>,
) -> ApiResult<impl IntoResponse> {
    let id = agency(&state, &agency_name)?
        .spawn(&body.agent_type, body.input)
        .await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

async fn delete_agent(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
) -> ApiResult<Json<Ack>> {
    agency(&state, &agency_name)?.delete_agent(&id).await?;
    Ok(Json(Ack::ok()))
}

/// One-time initialization; idempotent under the same thread id.
async fn register_agent(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
    Json(metadata): Json<agentry_core::ThreadMetadata>,
) -> ApiResult<Json<Ack>> {
    let (_, handle) = agent(&state, &agency_name, &id)?;
    handle.register(metadata).await?;
    Ok(Json(Ack::ok()))
}

/// 202 immediately; the run progresses via ticks.
async fn invoke_agent(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
    Json(body): Json<InvokeBody>,
) -> ApiResult<impl IntoResponse> {
    let (_, handle) = agent(&state, &agency_name, &id)?;
    let status = handle.invoke(body).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(InvokeAck {
            status: status.to_string(),
        }),
    ))
}

async fn agent_action(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
    Json(body): Json<ActionBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let (_, handle) = agent(&state, &agency_name, &id)?;
    Ok(Json(handle.action(body).await?))
}

async fn cancel_agent(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
) -> ApiResult<Json<Ack>> {
    let (_, handle) = agent(&state, &agency_name, &id)?;
    handle.cancel().await?;
    Ok(Json(Ack::ok()))
}

async fn agent_state(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
) -> ApiResult<Json<agentry_core::protocol::StateSnapshot>> {
    let (_, handle) = agent(&state, &agency_name, &id)?;
    Ok(Json(handle.snapshot().await?))
}

async fn agent_events(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
) -> ApiResult<Json<EventLog>> {
    let (_, handle) = agent(&state, &agency_name, &id)?;
    Ok(Json(EventLog {
        events: handle.events().await?,
    }))
}

async fn child_result(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
    Json(body): Json<ChildResultBody>,
) -> ApiResult<Json<Ack>> {
    let (_, handle) = agent(&state, &agency_name, &id)?;
    handle
        .child_result(body.token, body.child_thread_id, body.report)
        .await?;
    Ok(Json(Ack::ok()))
}

// -- vars --------------------------------------------------------------------

async fn list_vars(
    State(state): State<AppState>,
    Path(agency_name): Path<String>,
) -> ApiResult<Json<BTreeMap<String, serde_json::Value>>> {
    Ok(Json(agency(&state, &agency_name)?.catalog().vars_all()?))
}

async fn put_vars(
    State(state): State<AppState>,
    Path(agency_name): Path<String>,
    Json(vars): Json<BTreeMap<String, serde_json::Value>>,
) -> ApiResult<Json<Ack>> {
    let catalog = agency(&state, &agency_name)?.catalog();
    for (key, value) in &vars {
        catalog.var_set(key, value)?;
    }
    Ok(Json(Ack::ok()))
}

async fn get_var(
    State(state): State<AppState>,
    Path((agency_name, key)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let value = agency(&state, &agency_name)?
        .catalog()
        .var_get(&key)?
        .ok_or_else(|| Error::not_found(format!("var '{key}'")))?;
    Ok(Json(value))
}

async fn put_var(
    State(state): State<AppState>,
    Path((agency_name, key)): Path<(String, String)>,
    Json(value): Json<serde_json::Value>,
) -> ApiResult<Json<Ack>> {
    agency(&state, &agency_name)?.catalog().var_set(&key, &value)?;
    Ok(Json(Ack::ok()))
}

async fn delete_var(
    State(state): State<AppState>,
    Path((agency_name, key)): Path<(String, String)>,
) -> ApiResult<Json<Ack>> {
    let removed = agency(&state, &agency_name)?.catalog().var_delete(&key)?;
    if !removed {
        return Err(Error::not_found(format!("var '{key}'")).into());
    }
    Ok(Json(Ack::ok()))
}

// -- schedules ---------------------------------------------------------------

#[derive(Deserialize)]
struct ScheduleBody {
    name: String,
    #[serde(rename = "agentType")]
    agent_type: String,
    #[serde(default)]
    input: Option<serde_json::Value>,
    #[serde(rename = "type")]
    schedule_type: ScheduleType,
    #[serde(default)]
    run_at: Option<i64>,
    #[serde(default)]
    cron: Option<String>,
    #[serde(default)]
    interval_ms: Option<i64>,
    #[serde(default)]
    overlap_policy: OverlapPolicy,
    #[serde(default)]
    max_retries: u32,
    #[serde(default)]
    timeout_ms: Option<i64>,
    #[serde(default)]
    timezone: Option<String>,
}

impl ScheduleBody {
    fn into_schedule(self) -> Schedule {
        Schedule {
            id: String::new(),
            name: self.name,
            agent_type: self.agent_type,
            input: self.input,
            schedule_type: self.schedule_type,
            run_at: self.run_at,
            cron: self.cron,
            interval_ms: self.interval_ms,
            status: ScheduleStatus::Active,
            overlap_policy: self.overlap_policy,
            max_retries: self.max_retries,
            timeout_ms: self.timeout_ms,
            timezone: self.timezone,
            created_at: 0,
            updated_at: 0,
            last_run_at: None,
            next_run_at: None,
        }
    }
}

async fn list_schedules(
    State(state): State<AppState>,
    Path(agency_name): Path<String>,
) -> ApiResult<Json<Vec<Schedule>>> {
    Ok(Json(agency(&state, &agency_name)?.scheduler().list()?))
}

async fn create_schedule(
    State(state): State<AppState>,
    Path(agency_name): Path<String>,
    Json(body): Json<ScheduleBody>,
) -> ApiResult<impl IntoResponse> {
    let schedule = agency(&state, &agency_name)?
        .scheduler()
        .create(body.into_schedule())?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn get_schedule(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
) -> ApiResult<Json<Schedule>> {
    let schedule = agency(&state, &agency_name)?
        .scheduler()
        .get(&id)?
        .ok_or_else(|| Error::not_found(format!("schedule '{id}'")))?;
    Ok(Json(schedule))
}

async fn patch_schedule(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
    Json(patch): Json<serde_json::Value>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(
        agency(&state, &agency_name)?.scheduler().update(&id, &patch)?,
    ))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
) -> ApiResult<Json<Ack>> {
    let removed = agency(&state, &agency_name)?.scheduler().delete(&id)?;
    if !removed {
        return Err(Error::not_found(format!("schedule '{id}'")).into());
    }
    Ok(Json(Ack::ok()))
}

async fn pause_schedule(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(agency(&state, &agency_name)?.scheduler().pause(&id)?))
}

async fn resume_schedule(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(agency(&state, &agency_name)?.scheduler().resume(&id)?))
}

async fn trigger_schedule(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
) -> ApiResult<Json<agentry_core::ScheduleRun>> {
    Ok(Json(
        agency(&state, &agency_name)?.scheduler().trigger(&id).await?,
    ))
}

async fn schedule_runs(
    State(state): State<AppState>,
    Path((agency_name, id)): Path<(String, String)>,
) -> ApiResult<Json<Vec<agentry_core::ScheduleRun>>> {
    Ok(Json(agency(&state, &agency_name)?.scheduler().runs(&id)?))
}
