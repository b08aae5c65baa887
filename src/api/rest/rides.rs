use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::get;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, DispatchError};
use crate::models::presence::Availability;
use crate::models::ride::{Ride, RideState};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rides/:id", get(get_ride))
        .route("/stats", get(stats))
}

async fn get_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Ride>, AppError> {
    let ride = state
        .rides
        .get(&id)
        .ok_or_else(|| DispatchError::not_found_ride(id))?;

    Ok(Json(ride))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    active_rides: usize,
    searching_rides: usize,
    in_progress_rides: usize,
    online_drivers: usize,
    busy_drivers: usize,
    connected_riders: usize,
    locked_rides: usize,
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let rides = state.rides.snapshot();
    let searching_rides = rides
        .iter()
        .filter(|ride| ride.state == RideState::Searching)
        .count();
    let in_progress_rides = rides.iter().filter(|ride| ride.state.is_assigned()).count();

    Json(StatsResponse {
        active_rides: rides.len(),
        searching_rides,
        in_progress_rides,
        online_drivers: state.presence.drivers_with(Availability::Online).len(),
        busy_drivers: state.presence.drivers_with(Availability::Busy).len(),
        connected_riders: state.presence.rider_count(),
        locked_rides: state.locks.len(),
    })
}
