use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::admin::AdminState;
use crate::balancer::BackendStatus;
use crate::config::{validate_backend, BackendConfig};
use crate::load_balancer::backend::BackendView;
use crate::load_balancer::{BackendId, HealthState, RegistryError, Strategy};
use crate::observability::metrics::BackendMetrics;

/// Failure of an administrative call.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::Registry(RegistryError::Duplicate(_)) => StatusCode::CONFLICT,
            AdminError::Registry(RegistryError::Unknown(_)) => StatusCode::NOT_FOUND,
            AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

fn parse_id(raw: &str) -> Result<BackendId, AdminError> {
    raw.parse().map_err(|e| AdminError::BadRequest(format!("{}", e)))
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub strategy: Strategy,
    pub backends: usize,
    pub healthy: usize,
    pub in_flight: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StrategyBody {
    pub strategy: Strategy,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let snapshot = state.balancer.registry().snapshot();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        strategy: state.balancer.strategy(),
        backends: snapshot.len(),
        healthy: snapshot
            .backends()
            .iter()
            .filter(|b| b.health == HealthState::Healthy)
            .count(),
        in_flight: snapshot.total_in_flight(),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

pub async fn get_backends(State(state): State<AdminState>) -> Json<Vec<BackendStatus>> {
    Json(state.balancer.backends())
}

pub async fn add_backend(
    State(state): State<AdminState>,
    Json(config): Json<BackendConfig>,
) -> Result<(StatusCode, Json<BackendView>), AdminError> {
    validate_backend(&config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        AdminError::BadRequest(messages.join("; "))
    })?;
    let view = state.balancer.add_backend(&config)?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn remove_backend(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<BackendView>, AdminError> {
    let id = parse_id(&id)?;
    Ok(Json(state.balancer.remove_backend(&id)?))
}

pub async fn drain_backend(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AdminError> {
    state.balancer.drain_backend(&parse_id(&id)?)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn undrain_backend(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AdminError> {
    state.balancer.undrain_backend(&parse_id(&id)?)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn force_health_check(State(state): State<AdminState>) -> StatusCode {
    state.balancer.force_health_check();
    StatusCode::ACCEPTED
}

pub async fn get_strategy(State(state): State<AdminState>) -> Json<StrategyBody> {
    Json(StrategyBody {
        strategy: state.balancer.strategy(),
    })
}

pub async fn set_strategy(
    State(state): State<AdminState>,
    Json(body): Json<StrategyBody>,
) -> Json<StrategyBody> {
    state.balancer.set_strategy(body.strategy);
    Json(body)
}

pub async fn get_metrics(State(state): State<AdminState>) -> Json<Vec<BackendMetrics>> {
    Json(state.balancer.metrics())
}
