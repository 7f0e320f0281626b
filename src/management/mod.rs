use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use ocean_core::prelude::*;
use ocean_core::readiness::Ready;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::edge::EdgeReconciler;
use crate::forwarder::SupervisorError;
use crate::orchestrator::{PlanError, PlanOrchestrator, ProxyEndpoint};
use crate::ports::PortError;
use crate::provider::ProviderError;
use crate::store::{Store, StoreError};
use crate::types::{Instance, InstanceStatus, Plan, PlanRequest};

#[derive(Clone)]
pub struct ApiState {
	pub orchestrator: Arc<PlanOrchestrator>,
	pub store: Arc<dyn Store>,
	pub edge: Arc<EdgeReconciler>,
	pub ready: Ready,
	pub bearer_token: String,
}

pub fn router(state: ApiState) -> Router {
	let api = Router::new()
		.route("/plans", post(create_plan).get(list_plans))
		.route("/plans/{id}", get(get_plan).delete(delete_plan))
		.route("/proxies", get(list_proxies))
		.route("/proxies/{id}", get(get_proxy))
		.route("/proxies/{id}/start", post(start_proxy))
		.route("/proxies/{id}/stop", post(stop_proxy))
		.route("/proxies/{id}/restart", post(restart_proxy))
		.route("/proxies/{id}/status", get(proxy_status))
		.route("/edge/regenerate", post(regenerate_edge))
		.layer(middleware::from_fn_with_state(state.clone(), bearer_auth));

	Router::new()
		.route("/health", get(health))
		.route("/ready", get(ready))
		.nest("/api/v1", api)
		.layer(middleware::from_fn(request_id))
		.with_state(state)
}

#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Take the caller's x-request-id or mint one, and echo it on the response.
async fn request_id(mut req: axum::extract::Request, next: Next) -> Response {
	let id = req
		.headers()
		.get("x-request-id")
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string())
		.unwrap_or_else(|| Uuid::new_v4().to_string());
	req.extensions_mut().insert(RequestId(id.clone()));
	let mut resp = next.run(req).await;
	if let Ok(v) = HeaderValue::from_str(&id) {
		resp.headers_mut().insert("x-request-id", v);
	}
	resp
}

async fn bearer_auth(
	State(state): State<ApiState>,
	req: axum::extract::Request,
	next: Next,
) -> Response {
	if state.bearer_token.is_empty() {
		return next.run(req).await;
	}
	let rid = req
		.extensions()
		.get::<RequestId>()
		.cloned()
		.unwrap_or_else(|| RequestId(Uuid::new_v4().to_string()));
	let authorized = req
		.headers()
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.map(|t| t == state.bearer_token)
		.unwrap_or(false);
	if !authorized {
		return ApiError::unauthorized(rid).into_response();
	}
	next.run(req).await
}

async fn health() -> &'static str {
	"ok\n"
}

#[derive(Serialize)]
struct ReadyResponse {
	ready: bool,
	pending: Vec<String>,
}

async fn ready(State(state): State<ApiState>) -> Response {
	let mut pending: Vec<String> = state.ready.pending().into_iter().collect();
	if state.orchestrator.catalog().is_empty() {
		pending.push("catalog".to_string());
	}
	pending.sort();
	let ready = pending.is_empty();
	let status = if ready {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	};
	(status, Json(ReadyResponse { ready, pending })).into_response()
}

#[derive(Serialize)]
struct PlanResponse {
	success: bool,
	plan_id: Uuid,
	username: String,
	password: String,
	expires_at: DateTime<Utc>,
	proxies: Vec<ProxyEndpoint>,
}

async fn create_plan(
	State(state): State<ApiState>,
	Extension(rid): Extension<RequestId>,
	Json(req): Json<PlanRequest>,
) -> Result<(StatusCode, Json<PlanResponse>), ApiError> {
	let created = state
		.orchestrator
		.create_plan(req, CancellationToken::new())
		.await
		.map_err(|e| ApiError::from_plan(e, &rid))?;
	Ok((
		StatusCode::CREATED,
		Json(PlanResponse {
			success: true,
			plan_id: created.plan.id,
			username: created.plan.username.clone(),
			password: created.plan.password.clone(),
			expires_at: created.plan.expires_at,
			proxies: created.endpoints,
		}),
	))
}

#[derive(Deserialize)]
struct PlanListQuery {
	customer_id: Option<String>,
}

async fn list_plans(
	State(state): State<ApiState>,
	Query(q): Query<PlanListQuery>,
) -> Json<Vec<Plan>> {
	Json(state.orchestrator.list_plans(q.customer_id.as_deref()))
}

async fn get_plan(
	State(state): State<ApiState>,
	Extension(rid): Extension<RequestId>,
	Path(id): Path<Uuid>,
) -> Result<Json<Plan>, ApiError> {
	state
		.orchestrator
		.get_plan(id)
		.map(Json)
		.map_err(|e| ApiError::from_plan(e, &rid))
}

async fn delete_plan(
	State(state): State<ApiState>,
	Extension(rid): Extension<RequestId>,
	Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
	state
		.orchestrator
		.delete_plan(id)
		.await
		.map(|()| StatusCode::NO_CONTENT)
		.map_err(|e| ApiError::from_plan(e, &rid))
}

#[derive(Deserialize)]
struct ProxyListQuery {
	status: Option<String>,
	plan_id: Option<Uuid>,
}

async fn list_proxies(
	State(state): State<ApiState>,
	Extension(rid): Extension<RequestId>,
	Query(q): Query<ProxyListQuery>,
) -> Result<Json<Vec<Instance>>, ApiError> {
	let status = match q.status.as_deref() {
		Some(raw) => Some(
			raw
				.parse::<InstanceStatus>()
				.map_err(|e| ApiError::validation(e, &rid))?,
		),
		None => None,
	};
	Ok(Json(state.orchestrator.list_instances(status, q.plan_id)))
}

async fn get_proxy(
	State(state): State<ApiState>,
	Extension(rid): Extension<RequestId>,
	Path(id): Path<Uuid>,
) -> Result<Json<Instance>, ApiError> {
	state
		.orchestrator
		.get_instance(id)
		.map(Json)
		.map_err(|e| ApiError::from_plan(e, &rid))
}

async fn start_proxy(
	State(state): State<ApiState>,
	Extension(rid): Extension<RequestId>,
	Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
	state
		.orchestrator
		.start_instance(id)
		.await
		.map(|()| StatusCode::NO_CONTENT)
		.map_err(|e| ApiError::from_plan(e, &rid))
}

async fn stop_proxy(
	State(state): State<ApiState>,
	Extension(rid): Extension<RequestId>,
	Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
	state
		.orchestrator
		.stop_instance(id)
		.await
		.map(|()| StatusCode::NO_CONTENT)
		.map_err(|e| ApiError::from_plan(e, &rid))
}

async fn restart_proxy(
	State(state): State<ApiState>,
	Extension(rid): Extension<RequestId>,
	Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
	state
		.orchestrator
		.restart_instance(id)
		.await
		.map(|()| StatusCode::NO_CONTENT)
		.map_err(|e| ApiError::from_plan(e, &rid))
}

#[derive(Serialize)]
struct ProxyStatusResponse {
	id: Uuid,
	status: InstanceStatus,
}

async fn proxy_status(
	State(state): State<ApiState>,
	Extension(rid): Extension<RequestId>,
	Path(id): Path<Uuid>,
) -> Result<Json<ProxyStatusResponse>, ApiError> {
	let status = state
		.orchestrator
		.instance_status(id)
		.map_err(|e| ApiError::from_plan(e, &rid))?;
	Ok(Json(ProxyStatusResponse { id, status }))
}

async fn regenerate_edge(
	State(state): State<ApiState>,
	Extension(rid): Extension<RequestId>,
) -> Result<StatusCode, ApiError> {
	state
		.edge
		.regenerate_all(&state.store.instances())
		.await
		.map(|()| StatusCode::NO_CONTENT)
		.map_err(|e| ApiError::from_plan(PlanError::Edge(e), &rid))
}

/// Wire shape of every API failure.
#[derive(Debug, Serialize)]
pub struct ApiError {
	#[serde(skip)]
	status: StatusCode,
	error: ErrorBody,
	timestamp: DateTime<Utc>,
	request_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
	code: &'static str,
	message: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	details: Option<String>,
	#[serde(rename = "type")]
	kind: &'static str,
}

impl ApiError {
	fn new(
		status: StatusCode,
		code: &'static str,
		kind: &'static str,
		message: &'static str,
		details: Option<String>,
		rid: &RequestId,
	) -> Self {
		ApiError {
			status,
			error: ErrorBody {
				code,
				message,
				details,
				kind,
			},
			timestamp: Utc::now(),
			request_id: rid.0.clone(),
		}
	}

	fn unauthorized(rid: RequestId) -> Self {
		Self::new(
			StatusCode::UNAUTHORIZED,
			"AUTHENTICATION_ERROR",
			"authentication",
			"missing or invalid bearer token",
			None,
			&rid,
		)
	}

	fn validation(detail: impl ToString, rid: &RequestId) -> Self {
		Self::new(
			StatusCode::BAD_REQUEST,
			"VALIDATION_ERROR",
			"validation",
			"invalid request",
			Some(detail.to_string()),
			rid,
		)
	}

	/// Map orchestration failures onto the stable (status, code, type)
	/// taxonomy. Details carry diagnostics; messages never leak vendor names
	/// or internal ports.
	fn from_plan(err: PlanError, rid: &RequestId) -> Self {
		let details = Some(err.to_string());
		match err {
			PlanError::UnsupportedConfiguration { .. } | PlanError::MissingCredentials => Self::new(
				StatusCode::BAD_REQUEST,
				"VALIDATION_ERROR",
				"validation",
				"invalid plan request",
				details,
				rid,
			),
			PlanError::Provider(ProviderError::UnknownProvider(_)) => Self::new(
				StatusCode::BAD_REQUEST,
				"VALIDATION_ERROR",
				"validation",
				"unknown provider",
				details,
				rid,
			),
			PlanError::RegionNotConfigured(_) => Self::new(
				StatusCode::NOT_FOUND,
				"REGION_NOT_CONFIGURED",
				"not_found",
				"region is not configured",
				details,
				rid,
			),
			PlanError::PlanNotFound => Self::new(
				StatusCode::NOT_FOUND,
				"PLAN_NOT_FOUND",
				"not_found",
				"plan not found",
				None,
				rid,
			),
			PlanError::InstanceNotFound
			| PlanError::Supervisor(SupervisorError::NotFound(_))
			| PlanError::Store(StoreError::InstanceNotFound(_)) => Self::new(
				StatusCode::NOT_FOUND,
				"PROXY_NOT_FOUND",
				"not_found",
				"proxy not found",
				None,
				rid,
			),
			PlanError::Provider(ProviderError::NotFound) => Self::new(
				StatusCode::NOT_FOUND,
				"NOT_FOUND",
				"not_found",
				"upstream account not found",
				details,
				rid,
			),
			PlanError::Provider(ProviderError::Rejected { status: 429, .. }) => Self::new(
				StatusCode::TOO_MANY_REQUESTS,
				"RATE_LIMITED",
				"rate_limit",
				"upstream provider rate limit hit",
				details,
				rid,
			),
			PlanError::Provider(_) => Self::new(
				StatusCode::BAD_GATEWAY,
				"PROVIDER_ERROR",
				"provider_error",
				"upstream provider request failed",
				details,
				rid,
			),
			PlanError::Ports(PortError::NoPortsAvailable(_)) => Self::new(
				StatusCode::SERVICE_UNAVAILABLE,
				"PORT_UNAVAILABLE",
				"port_unavailable",
				"no capacity available for this plan type",
				details,
				rid,
			),
			PlanError::Supervisor(SupervisorError::SpawnFailed(_)) => Self::new(
				StatusCode::INTERNAL_SERVER_ERROR,
				"PROXY_START_FAILED",
				"proxy_start_failed",
				"proxy process failed to start",
				details,
				rid,
			),
			PlanError::Supervisor(SupervisorError::NotRunning(_)) => Self::new(
				StatusCode::CONFLICT,
				"CONFLICT",
				"conflict",
				"proxy is not running",
				details,
				rid,
			),
			PlanError::Store(StoreError::Duplicate(_)) => Self::new(
				StatusCode::CONFLICT,
				"CONFLICT",
				"conflict",
				"duplicate record",
				details,
				rid,
			),
			_ => Self::new(
				StatusCode::INTERNAL_SERVER_ERROR,
				"INTERNAL_ERROR",
				"internal",
				"internal error",
				details,
				rid,
			),
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		if self.status.is_server_error() {
			error!(code = self.error.code, request = %self.request_id, "request failed: {:?}", self.error.details);
		}
		(self.status, Json(self)).into_response()
	}
}
