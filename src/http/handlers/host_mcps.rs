use std::sync::Arc;

use axum::{extract::State, Json};

use crate::http::state::AppState;
use crate::supervisor::ProcessStatus;

/// GET /api/host-mcps - Configured capability servers and whether they run
pub async fn list_host_mcps(State(state): State<Arc<AppState>>) -> Json<Vec<ProcessStatus>> {
    let config = state.config.get();
    Json(state.supervisor.status(&config.host_mcps))
}
