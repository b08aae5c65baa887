//! Serializes concurrent accept attempts so exactly one driver wins a ride.
//!
//! Two phases: a lock-free fast reject, then the authoritative re-check once
//! the per-ride lock is held. The second phase is not redundant: the ride
//! can change between the two.

use rand::Rng;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::dispatch::ride_payload;
use crate::engine::notify::{Group, events};
use crate::engine::state_machine::{self, TransitionPatch};
use crate::error::{Conflict, DispatchError};
use crate::models::presence::Availability;
use crate::models::ride::{DriverDisplay, Ride, RideState, VerificationCode};
use crate::state::AppState;

/// Issues the one-time code the rider shows the driver at pickup.
pub fn issue_verification_code() -> VerificationCode {
    let code = rand::thread_rng().gen_range(0..10_000);
    VerificationCode {
        code: format!("{code:04}"),
        issued_at: chrono::Utc::now(),
    }
}

pub async fn accept_ride(
    state: &AppState,
    driver_id: &str,
    ride_id: Uuid,
    display: DriverDisplay,
) -> Result<Ride, DispatchError> {
    let result = try_accept(state, driver_id, ride_id, display).await;

    let outcome = match &result {
        Ok(_) => "accepted",
        Err(err) => err.code(),
    };
    state
        .metrics
        .accept_attempts_total
        .with_label_values(&[outcome])
        .inc();

    if let Err(err) = &result {
        warn!(ride_id = %ride_id, driver_id, error = %err, "accept rejected");
    }
    result
}

fn check_acceptable(state: &AppState, driver_id: &str, ride: &Ride) -> Result<(), DispatchError> {
    if state.presence.driver_availability(driver_id) == Some(Availability::Busy)
        || state.rides.driver_has_open_ride(driver_id, None)
    {
        return Err(Conflict::DriverBusy.into());
    }
    match ride.state {
        RideState::Searching => Ok(()),
        RideState::Accepted => Err(Conflict::AlreadyAccepted.into()),
        _ => Err(Conflict::RideNotAvailable.into()),
    }
}

async fn try_accept(
    state: &AppState,
    driver_id: &str,
    ride_id: Uuid,
    display: DriverDisplay,
) -> Result<Ride, DispatchError> {
    let ride = state
        .rides
        .get(&ride_id)
        .ok_or_else(|| DispatchError::not_found_ride(ride_id))?;
    if state.presence.driver_availability(driver_id) == Some(Availability::Busy) {
        return Err(Conflict::DriverBusy.into());
    }
    if ride.state == RideState::Accepted {
        return Err(Conflict::AlreadyAccepted.into());
    }
    if state.locks.is_locked(&ride_id) {
        return Err(Conflict::RideLocked.into());
    }
    if ride.state != RideState::Searching {
        return Err(Conflict::RideNotAvailable.into());
    }

    let _guard = state
        .locks
        .try_acquire(ride_id)
        .ok_or(DispatchError::Conflict(Conflict::RideLocked))?;

    // Let any handler that read the ride before we locked it run first.
    tokio::task::yield_now().await;

    let ride = state
        .rides
        .get(&ride_id)
        .ok_or_else(|| DispatchError::not_found_ride(ride_id))?;
    check_acceptable(state, driver_id, &ride)?;

    let verification = issue_verification_code();
    let code = verification.code.clone();
    let patch = TransitionPatch {
        driver_id: Some(driver_id.to_string()),
        driver: Some(display.clone()),
        verification: Some(verification),
        ..Default::default()
    };
    let ride = state_machine::transition_if(
        state,
        ride_id,
        &[RideState::Searching],
        RideState::Accepted,
        patch,
    )?
    .ride;

    state
        .presence
        .set_driver_availability(driver_id, Availability::Busy);

    let accepted_at = ride.accepted_at.unwrap_or(ride.updated_at).timestamp_millis();
    state.notifier.send_to_group(
        &Group::Rider(ride.rider_id.clone()),
        events::RIDE_ACCEPTED,
        json!({
            "rideId": ride.id,
            "driverId": driver_id,
            "driverName": display.name,
            "driverPhone": display.phone,
            "estimatedArrival": display.estimated_arrival,
            "verificationCode": code,
            "status": ride.state,
            "timestamp": accepted_at,
        }),
    );

    let mut details = ride_payload(&ride);
    details["driverId"] = json!(driver_id);
    details["acceptedAt"] = json!(accepted_at);
    state.notifier.send_to_group(
        &Group::Driver(driver_id.to_string()),
        events::RIDE_ACCEPTED_WITH_DETAILS,
        details,
    );

    state.notifier.send_to_group(
        &Group::Drivers,
        events::RIDE_TAKEN,
        json!({ "rideId": ride.id, "driverId": driver_id }),
    );

    state.offers.clear(&ride_id);

    info!(ride_id = %ride_id, driver_id, rider_id = %ride.rider_id, "ride accepted");
    Ok(ride)
}
