//! The only path that mutates a ride's `state`.
//!
//! Every change is checked against [`allowed_successors`] while holding the
//! ride's store entry, so two handlers racing on one ride can never both
//! apply a transition out of the same state.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::notify::{Group, events};
use crate::error::DispatchError;
use crate::models::ride::{Cancellation, DriverDisplay, Ride, RideState, VerificationCode};
use crate::state::AppState;

pub fn allowed_successors(from: RideState) -> &'static [RideState] {
    use RideState::*;

    match from {
        Searching => &[Accepted, Cancelled, Expired],
        Accepted => &[Arrived, Started, Cancelled, Completed],
        Arrived => &[Started, Cancelled],
        Started => &[Completed],
        Completed | Cancelled | Expired => &[],
    }
}

pub fn can_transition(from: RideState, to: RideState) -> bool {
    allowed_successors(from).contains(&to)
}

/// Fields merged into the ride together with a transition.
#[derive(Debug, Default)]
pub struct TransitionPatch {
    pub driver_id: Option<String>,
    pub driver: Option<DriverDisplay>,
    pub cancellation: Option<Cancellation>,
    pub verification: Option<VerificationCode>,
}

/// Outcome of an applied transition.
#[derive(Debug, Clone)]
pub struct Transitioned {
    pub from: RideState,
    pub ride: Ride,
}

pub fn transition(
    state: &AppState,
    ride_id: Uuid,
    to: RideState,
    patch: TransitionPatch,
) -> Result<Transitioned, DispatchError> {
    transition_from(state, ride_id, None, to, patch)
}

/// Like [`transition`], but additionally requires the current state to be
/// one of `expected`. Handlers use this where the adjacency table is wider
/// than what the caller may do (drivers cannot complete an un-started ride).
pub fn transition_if(
    state: &AppState,
    ride_id: Uuid,
    expected: &[RideState],
    to: RideState,
    patch: TransitionPatch,
) -> Result<Transitioned, DispatchError> {
    transition_from(state, ride_id, Some(expected), to, patch)
}

fn transition_from(
    state: &AppState,
    ride_id: Uuid,
    expected: Option<&[RideState]>,
    to: RideState,
    patch: TransitionPatch,
) -> Result<Transitioned, DispatchError> {
    let now = Utc::now();

    let outcome = state
        .rides
        .update(&ride_id, |ride| apply(ride, expected, to, patch, now))
        .ok_or_else(|| DispatchError::not_found_ride(ride_id))?;

    let transitioned = match outcome {
        Ok(transitioned) => transitioned,
        Err(err) => {
            debug!(ride_id = %ride_id, to = %to, error = %err, "transition rejected");
            return Err(err);
        }
    };

    state
        .metrics
        .ride_transitions_total
        .with_label_values(&[to.as_str()])
        .inc();

    info!(
        ride_id = %ride_id,
        from = %transitioned.from,
        to = %to,
        driver_id = transitioned.ride.driver_id.as_deref().unwrap_or("-"),
        "ride transitioned"
    );

    notify_status(state, &transitioned, now);
    Ok(transitioned)
}

fn apply(
    ride: &mut Ride,
    expected: Option<&[RideState]>,
    to: RideState,
    patch: TransitionPatch,
    now: DateTime<Utc>,
) -> Result<Transitioned, DispatchError> {
    let from = ride.state;
    let expected_ok = expected.is_none_or(|states| states.contains(&from));
    if !expected_ok || !can_transition(from, to) {
        return Err(DispatchError::InvalidTransition { from, to });
    }
    if to == RideState::Accepted && patch.driver_id.is_none() {
        return Err(DispatchError::Validation(vec!["driverId".to_string()]));
    }

    ride.state = to;
    ride.updated_at = now;

    match to {
        RideState::Accepted => ride.accepted_at = Some(now),
        RideState::Arrived => ride.arrived_at = Some(now),
        RideState::Started => ride.started_at = Some(now),
        RideState::Completed => ride.completed_at = Some(now),
        RideState::Searching | RideState::Cancelled | RideState::Expired => {}
    }
    // The code is only meaningful until the trip starts.
    if matches!(
        to,
        RideState::Started | RideState::Completed | RideState::Cancelled | RideState::Expired
    ) {
        ride.verification = None;
    }

    if let Some(driver_id) = patch.driver_id {
        ride.driver_id = Some(driver_id);
    }
    if let Some(driver) = patch.driver {
        ride.driver = Some(driver);
    }
    if let Some(cancellation) = patch.cancellation {
        ride.cancellation = Some(cancellation);
    }
    if let Some(verification) = patch.verification {
        ride.verification = Some(verification);
    }

    Ok(Transitioned {
        from,
        ride: ride.clone(),
    })
}

fn status_message(to: RideState) -> &'static str {
    match to {
        RideState::Searching => "Searching for drivers...",
        RideState::Accepted => "Driver is on the way",
        RideState::Arrived => "Driver has arrived at the pickup location",
        RideState::Started => "Ride started",
        RideState::Completed => "Ride completed",
        RideState::Cancelled => "Ride cancelled",
        RideState::Expired => "No driver accepted the ride in time",
    }
}

fn notify_status(state: &AppState, transitioned: &Transitioned, at: DateTime<Utc>) {
    let ride = &transitioned.ride;
    let payload = json!({
        "rideId": ride.id,
        "status": ride.state,
        "previousStatus": transitioned.from,
        "message": status_message(ride.state),
        "timestamp": at.timestamp_millis(),
    });

    state.notifier.send_to_group(
        &Group::Rider(ride.rider_id.clone()),
        events::RIDE_STATUS_UPDATE,
        payload.clone(),
    );
    if let Some(driver_id) = &ride.driver_id {
        state.notifier.send_to_group(
            &Group::Driver(driver_id.clone()),
            events::RIDE_STATUS_UPDATE,
            payload,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{TransitionPatch, allowed_successors, can_transition, transition, transition_if};
    use crate::engine::testing::{searching_ride, test_state};
    use crate::error::DispatchError;
    use crate::models::ride::RideState;

    const ALL: [RideState; 7] = [
        RideState::Searching,
        RideState::Accepted,
        RideState::Arrived,
        RideState::Started,
        RideState::Completed,
        RideState::Cancelled,
        RideState::Expired,
    ];

    #[test]
    fn terminal_states_reject_every_target() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(allowed_successors(from).is_empty());
            for to in ALL {
                assert!(!can_transition(from, to), "{from} -> {to} should be illegal");
            }
        }
    }

    #[test]
    fn expired_is_reachable_only_from_searching() {
        for from in ALL {
            assert_eq!(
                can_transition(from, RideState::Expired),
                from == RideState::Searching
            );
        }
    }

    #[test]
    fn cancel_is_refused_once_started() {
        assert!(can_transition(RideState::Arrived, RideState::Cancelled));
        assert!(!can_transition(RideState::Started, RideState::Cancelled));
        assert!(!can_transition(RideState::Completed, RideState::Cancelled));
    }

    #[test]
    fn accept_requires_a_driver() {
        let state = test_state();
        let ride = searching_ride(&state, "rider-1");

        let err = transition(&state, ride.id, RideState::Accepted, TransitionPatch::default())
            .unwrap_err();
        assert_eq!(err, DispatchError::Validation(vec!["driverId".to_string()]));
        assert_eq!(state.rides.get(&ride.id).unwrap().state, RideState::Searching);
    }

    #[test]
    fn invalid_transition_leaves_ride_unchanged() {
        let state = test_state();
        let ride = searching_ride(&state, "rider-1");

        let err = transition(&state, ride.id, RideState::Started, TransitionPatch::default())
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::InvalidTransition {
                from: RideState::Searching,
                to: RideState::Started
            }
        );
        let stored = state.rides.get(&ride.id).unwrap();
        assert_eq!(stored.state, RideState::Searching);
        assert_eq!(stored.updated_at, ride.updated_at);
    }

    #[test]
    fn accept_patch_sets_driver_and_timestamp() {
        let state = test_state();
        let ride = searching_ride(&state, "rider-1");

        let patch = TransitionPatch {
            driver_id: Some("driver-1".to_string()),
            ..Default::default()
        };
        let done = transition(&state, ride.id, RideState::Accepted, patch).unwrap();

        assert_eq!(done.from, RideState::Searching);
        assert_eq!(done.ride.driver_id.as_deref(), Some("driver-1"));
        assert!(done.ride.accepted_at.is_some());
    }

    #[test]
    fn transition_if_enforces_expected_state() {
        let state = test_state();
        let ride = searching_ride(&state, "rider-1");
        let patch = TransitionPatch {
            driver_id: Some("driver-1".to_string()),
            ..Default::default()
        };
        transition(&state, ride.id, RideState::Accepted, patch).unwrap();

        let err = transition_if(
            &state,
            ride.id,
            &[RideState::Started],
            RideState::Completed,
            TransitionPatch::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    }

    #[test]
    fn unknown_ride_is_not_found() {
        let state = test_state();
        let err = transition(
            &state,
            uuid::Uuid::new_v4(),
            RideState::Cancelled,
            TransitionPatch::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
