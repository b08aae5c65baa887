//! Cancellation by rider or assigned driver, with state-dependent fees.

use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::config::FeeSchedule;
use crate::engine::dispatch::purge_ride;
use crate::engine::notify::{Group, events};
use crate::engine::state_machine::{self, TransitionPatch};
use crate::error::{Conflict, DispatchError};
use crate::models::presence::Availability;
use crate::models::ride::{Cancellation, Ride, RideState, Role};
use crate::state::AppState;

/// Fee owed by `role` for cancelling in `state`; `None` when cancelling is
/// refused outright.
pub fn cancellation_fee(role: Role, state: RideState, fees: &FeeSchedule) -> Option<f64> {
    match (state, role) {
        (RideState::Searching, _) => Some(0.0),
        (RideState::Accepted, Role::Rider) => Some(fees.rider_accepted),
        (RideState::Accepted, Role::Driver) => Some(0.0),
        (RideState::Arrived, Role::Rider) => Some(fees.rider_arrived),
        (RideState::Arrived, Role::Driver) => Some(fees.driver_arrived),
        (
            RideState::Started | RideState::Completed | RideState::Cancelled | RideState::Expired,
            _,
        ) => None,
    }
}

fn authorize(ride: &Ride, role: Role, caller_id: &str) -> Result<(), DispatchError> {
    let allowed = match role {
        Role::Rider => ride.rider_id == caller_id,
        Role::Driver => ride.is_assigned_to(caller_id),
    };
    if allowed {
        Ok(())
    } else {
        Err(DispatchError::Unauthorized(format!(
            "{role} {caller_id} cannot cancel ride {}",
            ride.id
        )))
    }
}

fn lookup(state: &AppState, ride_id: Uuid) -> Result<Ride, DispatchError> {
    state.rides.get(&ride_id).ok_or_else(|| {
        if state.rides.was_cancelled(&ride_id) {
            Conflict::AlreadyCancelled.into()
        } else {
            DispatchError::not_found_ride(ride_id)
        }
    })
}

pub fn cancel_ride(
    state: &AppState,
    role: Role,
    caller_id: &str,
    ride_id: Uuid,
    reason: Option<String>,
) -> Result<Ride, DispatchError> {
    let ride = lookup(state, ride_id)?;
    authorize(&ride, role, caller_id)?;
    if cancellation_fee(role, ride.state, &state.fees).is_none() {
        return Err(DispatchError::InvalidTransition {
            from: ride.state,
            to: RideState::Cancelled,
        });
    }

    let _guard = state
        .locks
        .try_acquire(ride_id)
        .ok_or(DispatchError::Conflict(Conflict::RideLocked))?;

    // The ride may have advanced (or vanished) before the lock was taken;
    // the fee must match the state actually cancelled from.
    let ride = lookup(state, ride_id)?;
    authorize(&ride, role, caller_id)?;
    let from = ride.state;
    let fee = cancellation_fee(role, from, &state.fees).ok_or(
        DispatchError::InvalidTransition {
            from,
            to: RideState::Cancelled,
        },
    )?;
    let recipients = state.offers.recipients(&ride_id);

    let cancellation = Cancellation {
        cancelled_by: role,
        reason,
        fee,
        cancelled_at: Utc::now(),
    };
    let ride = state_machine::transition_if(
        state,
        ride_id,
        &[from],
        RideState::Cancelled,
        TransitionPatch {
            cancellation: Some(cancellation.clone()),
            ..Default::default()
        },
    )?
    .ride;

    finish_cancelled(state, &ride, from, &cancellation, recipients);
    info!(ride_id = %ride_id, cancelled_by = %role, fee, from = %from, "ride cancelled");
    Ok(ride)
}

/// Frees the driver, tells everyone involved and purges a ride that has
/// just moved to CANCELLED. Unassigned rides notify the offer recipients.
pub(crate) fn finish_cancelled(
    state: &AppState,
    ride: &Ride,
    from: RideState,
    cancellation: &Cancellation,
    recipients: Vec<String>,
) {
    if let Some(driver_id) = &ride.driver_id {
        release_driver(state, driver_id, ride.id);
    }
    state.rides.remember_cancelled(ride.id, cancellation.cancelled_at);

    let payload = json!({
        "rideId": ride.id,
        "cancelledBy": cancellation.cancelled_by,
        "reason": cancellation.reason,
        "fee": cancellation.fee,
        "previousStatus": from,
        "message": format!("Ride cancelled by {}", cancellation.cancelled_by),
        "timestamp": cancellation.cancelled_at.timestamp_millis(),
    });
    state.notifier.send_to_group(
        &Group::Rider(ride.rider_id.clone()),
        events::RIDE_CANCELLED,
        payload.clone(),
    );
    match &ride.driver_id {
        Some(driver_id) => state.notifier.send_to_group(
            &Group::Driver(driver_id.clone()),
            events::RIDE_CANCELLED,
            payload,
        ),
        None => {
            for driver_id in recipients {
                state.notifier.send_to_group(
                    &Group::Driver(driver_id),
                    events::RIDE_CANCELLED,
                    payload.clone(),
                );
            }
        }
    }

    purge_ride(state, ride.id);
}

/// Puts a driver back `online` unless they still hold another open ride.
pub fn release_driver(state: &AppState, driver_id: &str, finished_ride: Uuid) {
    if !state.rides.driver_has_open_ride(driver_id, Some(finished_ride)) {
        state
            .presence
            .set_driver_availability(driver_id, Availability::Online);
    }
}
