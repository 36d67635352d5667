pub mod events;
pub mod fleet;
pub mod health;
pub mod host_mcps;
pub mod tasks;

use crate::http::error::ApiError;
use crate::http::state::AppState;

/// Rejects drone names that are not part of the configured fleet.
pub fn validate_drone(state: &AppState, drone: &str) -> Result<(), ApiError> {
    if drone.contains(':') || drone.contains('/') || drone.contains("..") {
        return Err(ApiError::bad_request(
            "Invalid drone name: must not contain ':', '/', or '..'",
        ));
    }
    if !state.config.get().drone_names().iter().any(|d| d == drone) {
        return Err(ApiError::not_found(format!("Unknown drone: {}", drone)));
    }
    Ok(())
}
