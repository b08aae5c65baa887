//! Driver-driven progress after acceptance: arrive, start, complete.

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::engine::cancellation::release_driver;
use crate::engine::dispatch::purge_ride;
use crate::engine::notify::{Group, events};
use crate::engine::state_machine::{self, TransitionPatch};
use crate::error::{Conflict, DispatchError};
use crate::models::ride::{Ride, RideState};
use crate::state::AppState;

fn assigned_ride(state: &AppState, driver_id: &str, ride_id: Uuid) -> Result<Ride, DispatchError> {
    let ride = state
        .rides
        .get(&ride_id)
        .ok_or_else(|| DispatchError::not_found_ride(ride_id))?;
    if !ride.is_assigned_to(driver_id) {
        return Err(DispatchError::Unauthorized(format!(
            "driver {driver_id} is not assigned to ride {ride_id}"
        )));
    }
    Ok(ride)
}

pub fn driver_arrived(state: &AppState, driver_id: &str, ride_id: Uuid) -> Result<Ride, DispatchError> {
    assigned_ride(state, driver_id, ride_id)?;
    let _guard = state
        .locks
        .try_acquire(ride_id)
        .ok_or(DispatchError::Conflict(Conflict::RideLocked))?;

    let ride = state_machine::transition_if(
        state,
        ride_id,
        &[RideState::Accepted],
        RideState::Arrived,
        TransitionPatch::default(),
    )?
    .ride;

    info!(ride_id = %ride_id, driver_id, "driver arrived at pickup");
    Ok(ride)
}

/// Starts the trip once the rider's code checks out. The code is consumed.
pub fn start_ride(
    state: &AppState,
    driver_id: &str,
    ride_id: Uuid,
    code: &str,
) -> Result<Ride, DispatchError> {
    assigned_ride(state, driver_id, ride_id)?;
    let _guard = state
        .locks
        .try_acquire(ride_id)
        .ok_or(DispatchError::Conflict(Conflict::RideLocked))?;

    let ride = assigned_ride(state, driver_id, ride_id)?;
    if !matches!(ride.state, RideState::Accepted | RideState::Arrived) {
        return Err(DispatchError::InvalidTransition {
            from: ride.state,
            to: RideState::Started,
        });
    }
    let matches = ride
        .verification
        .as_ref()
        .is_some_and(|issued| issued.code == code.trim());
    if !matches {
        return Err(DispatchError::Unauthorized(
            "verification code does not match".to_string(),
        ));
    }

    let ride = state_machine::transition_if(
        state,
        ride_id,
        &[RideState::Accepted, RideState::Arrived],
        RideState::Started,
        TransitionPatch::default(),
    )?
    .ride;

    info!(ride_id = %ride_id, driver_id, "ride started");
    Ok(ride)
}

pub fn complete_ride(state: &AppState, driver_id: &str, ride_id: Uuid) -> Result<Ride, DispatchError> {
    assigned_ride(state, driver_id, ride_id)?;

    let ride = state_machine::transition_if(
        state,
        ride_id,
        &[RideState::Started],
        RideState::Completed,
        TransitionPatch::default(),
    )?
    .ride;

    finish_completed(state, &ride, false);
    info!(ride_id = %ride_id, driver_id, price = ride.price, "ride completed");
    Ok(ride)
}

/// Notifies both parties of a completed ride, frees the driver and purges.
pub(crate) fn finish_completed(state: &AppState, ride: &Ride, forced: bool) {
    if let Some(driver_id) = &ride.driver_id {
        release_driver(state, driver_id, ride.id);
    }

    let message = if forced {
        "Ride closed automatically"
    } else {
        "Ride completed successfully"
    };
    let payload = json!({
        "rideId": ride.id,
        "driverId": ride.driver_id,
        "price": ride.price,
        "forced": forced,
        "message": message,
        "timestamp": ride.completed_at.unwrap_or(ride.updated_at).timestamp_millis(),
    });
    state.notifier.send_to_group(
        &Group::Rider(ride.rider_id.clone()),
        events::RIDE_COMPLETED,
        payload.clone(),
    );
    if let Some(driver_id) = &ride.driver_id {
        state.notifier.send_to_group(
            &Group::Driver(driver_id.clone()),
            events::RIDE_COMPLETED,
            payload,
        );
    }

    purge_ride(state, ride.id);
}
