use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::config::AgentRole;
use crate::http::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub api_version: String,
    pub role: AgentRole,
    pub agent: String,
    pub monitoring: bool,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        api_version: "v1".to_string(),
        role: state.identity.role,
        agent: state.identity.name.clone(),
        monitoring: state.monitor.is_running(),
    })
}
