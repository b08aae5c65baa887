//! Connect/disconnect handling for drivers and riders.
//!
//! A driver who drops mid-ride keeps the assignment: the rider is told the
//! driver disconnected, and a reconnect restores `busy` and resends the ride.
//! The reaper's stuck-ride sweep covers drivers who never come back.

use serde_json::json;
use tracing::{info, warn};

use crate::engine::dispatch::{offer_backlog, ride_payload};
use crate::engine::notify::{Group, events};
use crate::error::DispatchError;
use crate::models::presence::{Availability, GeoPoint};
use crate::state::AppState;

pub fn driver_connected(state: &AppState, driver_id: &str, connection_id: &str) {
    match state.rides.active_ride_for_driver(driver_id) {
        Some(ride) => {
            state
                .presence
                .connect_driver(driver_id, connection_id, Availability::Busy);
            let mut payload = ride_payload(&ride);
            payload["driver"] = json!(ride.driver);
            state.notifier.send_to_group(
                &Group::Driver(driver_id.to_string()),
                events::ACTIVE_RIDE,
                payload,
            );
            info!(driver_id, ride_id = %ride.id, "driver reconnected to active ride");
        }
        None => {
            state
                .presence
                .connect_driver(driver_id, connection_id, Availability::Online);
            offer_backlog(state, driver_id);
            info!(driver_id, "driver online");
        }
    }
    state
        .metrics
        .connected_drivers
        .set(state.presence.driver_count() as i64);
}

pub fn driver_disconnected(state: &AppState, driver_id: &str, connection_id: &str) {
    if !state.presence.disconnect_driver(driver_id, connection_id) {
        return;
    }
    state
        .metrics
        .connected_drivers
        .set(state.presence.driver_count() as i64);

    match state.rides.active_ride_for_driver(driver_id) {
        Some(ride) => {
            warn!(driver_id, ride_id = %ride.id, state = %ride.state, "assigned driver disconnected");
            state.notifier.send_to_group(
                &Group::Rider(ride.rider_id.clone()),
                events::DRIVER_DISCONNECTED,
                json!({
                    "rideId": ride.id,
                    "driverId": driver_id,
                    "message": "Your driver lost connection. Waiting for them to reconnect.",
                }),
            );
        }
        None => info!(driver_id, "driver offline"),
    }
}

pub fn rider_connected(state: &AppState, rider_id: &str, connection_id: &str) {
    state.presence.connect_rider(rider_id, connection_id);

    let open_ride = state
        .rides
        .rider_ride(rider_id)
        .and_then(|ride_id| state.rides.get(&ride_id))
        .filter(|ride| !ride.state.is_terminal());
    if let Some(ride) = open_ride {
        let mut payload = ride_payload(&ride);
        payload["driverId"] = json!(ride.driver_id);
        payload["driver"] = json!(ride.driver);
        state.notifier.send_to_group(
            &Group::Rider(rider_id.to_string()),
            events::ACTIVE_RIDE,
            payload,
        );
    }
    info!(rider_id, "rider connected");
}

pub fn rider_disconnected(state: &AppState, rider_id: &str, connection_id: &str) {
    if state.presence.disconnect_rider(rider_id, connection_id) {
        info!(rider_id, "rider disconnected");
    }
}

/// Records the driver's position and forwards it to the rider of their
/// active ride, if any.
pub fn update_driver_location(
    state: &AppState,
    driver_id: &str,
    location: GeoPoint,
) -> Result<(), DispatchError> {
    let valid = location.latitude.is_finite()
        && location.longitude.is_finite()
        && (-90.0..=90.0).contains(&location.latitude)
        && (-180.0..=180.0).contains(&location.longitude);
    if !valid {
        return Err(DispatchError::Validation(vec![
            "latitude".to_string(),
            "longitude".to_string(),
        ]));
    }

    if !state.presence.update_driver_location(driver_id, location) {
        return Err(DispatchError::NotFound(format!("driver {driver_id}")));
    }

    if let Some(ride) = state.rides.active_ride_for_driver(driver_id) {
        state.notifier.send_to_group(
            &Group::Rider(ride.rider_id.clone()),
            events::DRIVER_LOCATION_UPDATE,
            json!({
                "rideId": ride.id,
                "driverId": driver_id,
                "latitude": location.latitude,
                "longitude": location.longitude,
                "timestamp": chrono::Utc::now().timestamp_millis(),
            }),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::update_driver_location;
    use crate::engine::testing::{accepted_ride, connect_driver, connect_rider, test_state};
    use crate::models::presence::{Availability, GeoPoint};

    #[test]
    fn reconnecting_assigned_driver_is_busy_and_resumes() {
        let state = test_state();
        let ride = accepted_ride(&state, "rider-1", "d1");
        let mut rider = connect_rider(&state, "rider-1");

        let driver = connect_driver(&state, "d1");
        driver.disconnect(&state);
        assert!(state.presence.driver("d1").is_none());
        assert_eq!(rider.payloads("driver_disconnected").len(), 1);

        let mut back = connect_driver(&state, "d1");
        assert_eq!(state.presence.driver_availability("d1"), Some(Availability::Busy));
        let resumed = back.payloads("active_ride");
        assert_eq!(resumed[0]["rideId"], serde_json::json!(ride.id));
    }

    #[test]
    fn rider_reconnect_receives_open_ride() {
        let state = test_state();
        let ride = accepted_ride(&state, "rider-1", "d1");

        let mut rider = connect_rider(&state, "rider-1");
        let resumed = rider.payloads("active_ride");
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0]["driverId"], "d1");
        assert_eq!(resumed[0]["rideId"], serde_json::json!(ride.id));
    }

    #[test]
    fn location_is_forwarded_to_rider() {
        let state = test_state();
        accepted_ride(&state, "rider-1", "d1");
        let mut rider = connect_rider(&state, "rider-1");
        let _driver = connect_driver(&state, "d1");

        update_driver_location(
            &state,
            "d1",
            GeoPoint {
                latitude: 17.44,
                longitude: 78.35,
            },
        )
        .unwrap();

        let updates = rider.payloads("driver_location_update");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["latitude"], 17.44);
    }

    #[test]
    fn location_from_unknown_driver_is_not_found() {
        let state = test_state();
        let err = update_driver_location(
            &state,
            "ghost",
            GeoPoint {
                latitude: 1.0,
                longitude: 1.0,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
