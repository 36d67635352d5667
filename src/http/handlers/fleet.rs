use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::dispatch::DroneStatus;
use crate::http::error::ApiError;
use crate::http::state::AppState;

#[derive(Serialize)]
pub struct FleetResponse {
    pub project: String,
    pub drones: Vec<DroneStatus>,
}

/// GET /api/fleet - Queue, active and history counts for every drone
pub async fn fleet_status(State(state): State<Arc<AppState>>) -> Result<Json<FleetResponse>, ApiError> {
    let config = state.config.get();
    let drones = state.queue.fleet_status(&config.drone_names()).await?;
    Ok(Json(FleetResponse {
        project: config.workspace.name.clone(),
        drones,
    }))
}
