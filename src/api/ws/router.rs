//! Maps inbound client events onto engine operations.
//!
//! Every failure is answered with `<event>_error` on the originating
//! connection only; nothing propagates past this boundary.

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::ws::hub::{ClientIdentity, ClientKind};
use crate::engine::notify::events;
use crate::engine::{arbiter, cancellation, dispatch, lifecycle, presence};
use crate::error::DispatchError;
use crate::models::presence::GeoPoint;
use crate::models::ride::{DriverDisplay, Role};
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: String,
    pub identity: ClientIdentity,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RideResponsePayload {
    ride_id: Uuid,
    driver_id: Option<String>,
    response: Option<String>,
    driver_name: Option<String>,
    driver_phone: Option<String>,
    estimated_arrival: Option<String>,
}

impl RideResponsePayload {
    fn display(&self) -> DriverDisplay {
        DriverDisplay {
            name: self.driver_name.clone(),
            phone: self.driver_phone.clone(),
            estimated_arrival: self.estimated_arrival.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RidePayload {
    ride_id: Uuid,
    driver_id: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPayload {
    ride_id: Uuid,
    driver_id: Option<String>,
    #[serde(alias = "otp", alias = "mpin")]
    code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelPayload {
    ride_id: Uuid,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationPayload {
    latitude: f64,
    longitude: f64,
    driver_id: Option<String>,
}

fn parse<T: DeserializeOwned>(data: Value) -> Result<T, DispatchError> {
    serde_json::from_value(data).map_err(|err| DispatchError::Validation(vec![err.to_string()]))
}

fn require_kind(session: &Session, kind: ClientKind, action: &str) -> Result<(), DispatchError> {
    if session.identity.kind == kind {
        Ok(())
    } else {
        Err(DispatchError::Unauthorized(format!(
            "{action} is not available to this client"
        )))
    }
}

/// Payload identity fields are advisory; they must agree with the session.
fn ensure_claimed(claimed: Option<&str>, session: &Session) -> Result<(), DispatchError> {
    match claimed {
        Some(claimed) if !claimed.is_empty() && claimed != session.identity.id => Err(
            DispatchError::Unauthorized("payload identity does not match the connection".into()),
        ),
        _ => Ok(()),
    }
}

pub async fn handle_event(state: &Arc<AppState>, session: &Session, event: &str, data: Value) {
    debug!(connection_id = %session.connection_id, event, "inbound event");

    if let Err(err) = route(state, session, event, data).await {
        warn!(
            connection_id = %session.connection_id,
            client_id = %session.identity.id,
            event,
            error = %err,
            "event rejected"
        );
        let error_event = if is_known(event) {
            format!("{event}_error")
        } else {
            events::ERROR.to_string()
        };
        state
            .notifier
            .send_to_client(&session.connection_id, &error_event, err.to_payload());
    }
}

const KNOWN_EVENTS: &[&str] = &[
    "request_ride",
    "book_ride",
    "ride_response",
    "accept_ride",
    "reject_ride",
    "driver_arrived",
    "start_ride",
    "complete_ride",
    "cancel_ride",
    "driver_location",
    "ping",
];

fn is_known(event: &str) -> bool {
    KNOWN_EVENTS.contains(&event)
}

async fn route(
    state: &Arc<AppState>,
    session: &Session,
    event: &str,
    data: Value,
) -> Result<(), DispatchError> {
    let client_id = session.identity.id.as_str();

    match event {
        "request_ride" | "book_ride" => {
            require_kind(session, ClientKind::Rider, "requesting a ride")?;
            state.presence.touch_rider(client_id);
            dispatch::request_ride(state, client_id, parse(data)?)?;
        }
        "ride_response" | "accept_ride" | "reject_ride" => {
            require_kind(session, ClientKind::Driver, "responding to a ride")?;
            let payload: RideResponsePayload = parse(data)?;
            ensure_claimed(payload.driver_id.as_deref(), session)?;

            let response = match event {
                "accept_ride" => "accept",
                "reject_ride" => "reject",
                _ => payload.response.as_deref().unwrap_or_default(),
            };
            match response {
                "accept" => {
                    arbiter::accept_ride(state, client_id, payload.ride_id, payload.display())
                        .await?;
                }
                "reject" => dispatch::reject_ride(state, client_id, payload.ride_id)?,
                _ => return Err(DispatchError::Validation(vec!["response".to_string()])),
            }
        }
        "driver_arrived" => {
            require_kind(session, ClientKind::Driver, "marking arrival")?;
            let payload: RidePayload = parse(data)?;
            ensure_claimed(payload.driver_id.as_deref(), session)?;
            lifecycle::driver_arrived(state, client_id, payload.ride_id)?;
        }
        "start_ride" => {
            require_kind(session, ClientKind::Driver, "starting a ride")?;
            let payload: StartPayload = parse(data)?;
            ensure_claimed(payload.driver_id.as_deref(), session)?;
            lifecycle::start_ride(state, client_id, payload.ride_id, &payload.code)?;
        }
        "complete_ride" => {
            require_kind(session, ClientKind::Driver, "completing a ride")?;
            let payload: RidePayload = parse(data)?;
            ensure_claimed(payload.driver_id.as_deref(), session)?;
            lifecycle::complete_ride(state, client_id, payload.ride_id)?;
        }
        "cancel_ride" => {
            let role = match session.identity.kind {
                ClientKind::Rider => Role::Rider,
                ClientKind::Driver => Role::Driver,
            };
            let payload: CancelPayload = parse(data.clone())?;
            let claimed: Option<RidePayload> = serde_json::from_value(data).ok();
            if let Some(claimed) = claimed {
                let claimed_id = match role {
                    Role::Rider => claimed.user_id,
                    Role::Driver => claimed.driver_id,
                };
                ensure_claimed(claimed_id.as_deref(), session)?;
            }
            cancellation::cancel_ride(state, role, client_id, payload.ride_id, payload.reason)?;
        }
        "driver_location" => {
            require_kind(session, ClientKind::Driver, "sharing location")?;
            let payload: LocationPayload = parse(data)?;
            ensure_claimed(payload.driver_id.as_deref(), session)?;
            presence::update_driver_location(
                state,
                client_id,
                GeoPoint {
                    latitude: payload.latitude,
                    longitude: payload.longitude,
                },
            )?;
        }
        "ping" => {
            state.notifier.send_to_client(
                &session.connection_id,
                events::PONG,
                json!({ "timestamp": chrono::Utc::now().timestamp_millis() }),
            );
        }
        unknown => {
            return Err(DispatchError::Validation(vec![format!("unknown event {unknown}")]));
        }
    }

    Ok(())
}
