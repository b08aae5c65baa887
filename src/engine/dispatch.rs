//! Ride creation, offer fan-out and the per-ride expiry timer.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::notify::{Group, events};
use crate::engine::state_machine::{self, TransitionPatch};
use crate::error::{Conflict, DispatchError};
use crate::models::presence::Availability;
use crate::models::ride::{Place, Ride, RideState};
use crate::state::AppState;

/// Rider payload as sent by the app. Fields stay as raw JSON so that
/// validation can report every defect at once, wrong types included.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRequest {
    pub pickup: Option<Value>,
    pub drop: Option<Value>,
    pub ride_type: Option<Value>,
    pub price: Option<Value>,
    pub user_id: Option<Value>,
    pub distance: Option<Value>,
    pub duration: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub pickup: Place,
    pub drop: Place,
    pub ride_type: String,
    pub price: f64,
    pub distance: Option<f64>,
    pub duration: Option<f64>,
}

fn number(value: Option<&Value>) -> Option<f64> {
    value
        .and_then(Value::as_f64)
        .filter(|number| number.is_finite())
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn validate_place(input: Option<&Value>, field: &str, errors: &mut Vec<String>) -> Option<Place> {
    let Some(Value::Object(input)) = input else {
        errors.push(field.to_string());
        return None;
    };

    let latitude = number(input.get("latitude"));
    let longitude = number(input.get("longitude"));
    if latitude.is_none() {
        errors.push(format!("{field}.latitude"));
    }
    if longitude.is_none() {
        errors.push(format!("{field}.longitude"));
    }

    Some(Place {
        latitude: latitude?,
        longitude: longitude?,
        address: text(input.get("address")),
        name: text(input.get("name")),
        external_id: text(input.get("id")),
        category: text(input.get("type")),
    })
}

/// Checks a ride request, collecting every violated field.
pub fn validate_request(
    request: &RideRequest,
    rider_id: &str,
) -> Result<ValidatedRequest, DispatchError> {
    let mut errors = Vec::new();

    let pickup = validate_place(request.pickup.as_ref(), "pickup", &mut errors);
    let drop = validate_place(request.drop.as_ref(), "drop", &mut errors);

    let price = number(request.price.as_ref()).filter(|price| *price > 0.0);
    if price.is_none() {
        errors.push("price".to_string());
    }

    let ride_type = match &request.ride_type {
        Some(Value::String(ride_type)) => Some(ride_type.trim()).filter(|t| !t.is_empty()),
        _ => None,
    };
    if ride_type.is_none() {
        errors.push("rideType".to_string());
    }

    if rider_id.trim().is_empty() {
        errors.push("riderId".to_string());
    }

    match (pickup, drop, price, ride_type) {
        (Some(pickup), Some(drop), Some(price), Some(ride_type)) if errors.is_empty() => {
            Ok(ValidatedRequest {
                pickup,
                drop,
                ride_type: ride_type.to_string(),
                price,
                distance: number(request.distance.as_ref()),
                duration: number(request.duration.as_ref()),
            })
        }
        _ => Err(DispatchError::Validation(errors)),
    }
}

/// Place rendered for clients: `address` and `name` always present.
pub fn place_payload(place: &Place, fallback_name: &str) -> Value {
    let coordinates = format!("{:.6}, {:.6}", place.latitude, place.longitude);
    let address = place
        .address
        .clone()
        .or_else(|| place.name.clone())
        .unwrap_or(coordinates);
    let name = place
        .name
        .clone()
        .or_else(|| place.address.clone())
        .unwrap_or_else(|| fallback_name.to_string());

    let mut payload = json!({
        "latitude": place.latitude,
        "longitude": place.longitude,
        "address": address,
        "name": name,
    });
    if let Some(id) = &place.external_id {
        payload["id"] = json!(id);
    }
    if let Some(category) = &place.category {
        payload["type"] = json!(category);
    }
    payload
}

/// Offer payload shared by the broadcast, the backlog and acceptance detail.
pub fn ride_payload(ride: &Ride) -> Value {
    json!({
        "rideId": ride.id,
        "userId": ride.rider_id,
        "pickup": place_payload(&ride.pickup, "Pickup location"),
        "drop": place_payload(&ride.drop, "Drop location"),
        "rideType": ride.ride_type,
        "price": ride.price,
        "distance": ride.distance,
        "duration": ride.duration,
        "status": ride.state,
        "createdAt": ride.created_at.timestamp_millis(),
    })
}

/// Creates a SEARCHING ride, offers it to every online driver and arms the
/// expiry timer.
pub fn request_ride(
    state: &Arc<AppState>,
    rider_id: &str,
    request: RideRequest,
) -> Result<Ride, DispatchError> {
    if let Some(claimed) = text(request.user_id.as_ref()) {
        if claimed != rider_id {
            return Err(DispatchError::Unauthorized(
                "userId does not match the connected rider".to_string(),
            ));
        }
    }
    let validated = validate_request(&request, rider_id)?;

    let now = Utc::now();
    let ride = Ride {
        id: Uuid::new_v4(),
        rider_id: rider_id.to_string(),
        pickup: validated.pickup,
        drop: validated.drop,
        ride_type: validated.ride_type,
        price: validated.price,
        state: RideState::Searching,
        created_at: now,
        updated_at: now,
        driver_id: None,
        driver: None,
        accepted_at: None,
        arrived_at: None,
        started_at: None,
        completed_at: None,
        distance: validated.distance,
        duration: validated.duration,
        cancellation: None,
        verification: None,
    };

    if let Err(existing) = state.rides.insert_for_rider(ride.clone()) {
        warn!(rider_id, existing_ride = %existing.id, "rider already has an open ride");
        return Err(Conflict::ActiveRide {
            ride_id: existing.id,
            searching: existing.state == RideState::Searching,
        }
        .into());
    }

    state.metrics.rides_created_total.inc();
    state.metrics.active_rides.set(state.rides.len() as i64);

    state.notifier.send_to_group(
        &Group::Rider(rider_id.to_string()),
        events::RIDE_REQUEST_CREATED,
        json!({
            "success": true,
            "rideId": ride.id,
            "status": ride.state,
            "price": ride.price,
            "message": "Searching for drivers...",
        }),
    );

    let offered = broadcast_offer(state, &ride);
    info!(ride_id = %ride.id, rider_id, price = ride.price, offered, "ride requested");

    schedule_expiry(state.clone(), ride.id);
    Ok(ride)
}

/// Offers the ride to every currently online driver that has not seen it.
fn broadcast_offer(state: &AppState, ride: &Ride) -> usize {
    let payload = ride_payload(ride);
    let mut offered = 0;

    for driver_id in state.presence.drivers_with(Availability::Online) {
        if state.offers.offer_to(ride.id, &driver_id) {
            state.notifier.send_to_group(
                &Group::Driver(driver_id),
                events::NEW_RIDE_REQUEST,
                payload.clone(),
            );
            offered += 1;
        }
    }

    offered
}

fn schedule_expiry(state: Arc<AppState>, ride_id: Uuid) {
    let timeout = state.timeouts.search_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        expire_if_searching(&state, ride_id);
    });
}

/// SEARCHING → EXPIRED plus rider notification and purge.
///
/// Returns false (and does nothing) when the ride is gone or has moved on.
pub fn expire_if_searching(state: &AppState, ride_id: Uuid) -> bool {
    let recipients = state.offers.recipients(&ride_id);
    let transitioned = match state_machine::transition_if(
        state,
        ride_id,
        &[RideState::Searching],
        RideState::Expired,
        TransitionPatch::default(),
    ) {
        Ok(transitioned) => transitioned,
        Err(err) => {
            debug!(ride_id = %ride_id, error = %err, "expiry skipped");
            return false;
        }
    };

    let ride = transitioned.ride;
    let payload = json!({
        "rideId": ride.id,
        "status": ride.state,
        "message": "No drivers accepted your ride. Please try again.",
        "timestamp": ride.updated_at.timestamp_millis(),
    });
    state.notifier.send_to_group(
        &Group::Rider(ride.rider_id.clone()),
        events::RIDE_EXPIRED,
        payload.clone(),
    );
    for driver_id in recipients {
        state
            .notifier
            .send_to_group(&Group::Driver(driver_id), events::RIDE_EXPIRED, payload.clone());
    }

    purge_ride(state, ride_id);
    info!(ride_id = %ride_id, rider_id = %ride.rider_id, "ride expired");
    true
}

/// Sends the SEARCHING rides this driver has not been offered yet.
pub fn offer_backlog(state: &AppState, driver_id: &str) -> Vec<Ride> {
    if state.presence.driver_availability(driver_id) != Some(Availability::Online) {
        return Vec::new();
    }

    let mut backlog: Vec<Ride> = state
        .rides
        .find(|ride| ride.state == RideState::Searching)
        .into_iter()
        .filter(|ride| state.offers.offer_to(ride.id, driver_id))
        .collect();
    backlog.sort_by_key(|ride| ride.created_at);

    if !backlog.is_empty() {
        let payload: Vec<Value> = backlog.iter().map(ride_payload).collect();
        state.notifier.send_to_group(
            &Group::Driver(driver_id.to_string()),
            events::ACTIVE_RIDE_REQUESTS,
            json!(payload),
        );
        info!(driver_id, count = backlog.len(), "sent ride backlog");
    }

    backlog
}

/// Bookkeeping for an explicit rejection; the ride stays SEARCHING.
pub fn reject_ride(state: &AppState, driver_id: &str, ride_id: Uuid) -> Result<(), DispatchError> {
    if !state.rides.contains(&ride_id) {
        return Err(DispatchError::not_found_ride(ride_id));
    }
    state.offers.record_response(ride_id, driver_id);
    state.offers.withdraw(ride_id, driver_id);

    state.notifier.send_to_group(
        &Group::Driver(driver_id.to_string()),
        events::RIDE_REJECTED,
        json!({ "rideId": ride_id, "success": true }),
    );
    debug!(ride_id = %ride_id, driver_id, "driver rejected ride");
    Ok(())
}

/// Drops the ride and all per-ride tracking. Unknown ids are a no-op.
pub fn purge_ride(state: &AppState, ride_id: Uuid) {
    state.rides.purge(&ride_id);
    state.offers.clear(&ride_id);
    state.metrics.active_rides.set(state.rides.len() as i64);
}
