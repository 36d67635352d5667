use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use crate::http::state::AppState;
use crate::http::handlers::{events, fleet, health, host_mcps, tasks};

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/fleet", get(fleet::fleet_status))
        // Monitor event routes
        .route("/api/events", get(events::recent_events))
        .route("/api/events/stream", get(events::stream_events))
        // Task routes
        .route("/api/drones/{drone}/tasks", post(tasks::submit_task))
        .route("/api/tasks", get(tasks::list_tasks))
        .route("/api/tasks/{id}", get(tasks::get_task))
        .route("/api/host-mcps", get(host_mcps::list_host_mcps))
        .layer(cors)
        .with_state(state)
}
