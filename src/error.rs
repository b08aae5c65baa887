use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::models::ride::RideState;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Failure of a dispatch operation. Always recovered at the handler boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("invalid payload: {}", .0.join(", "))]
    Validation(Vec<String>),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(Conflict),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: RideState, to: RideState },

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Conflict {
    #[error("driver is already on a ride")]
    DriverBusy,

    #[error("ride has already been accepted by another driver")]
    AlreadyAccepted,

    #[error("ride is being processed, try again")]
    RideLocked,

    #[error("ride has already been cancelled")]
    AlreadyCancelled,

    #[error("ride is no longer available")]
    RideNotAvailable,

    #[error("{}", active_ride_message(.searching))]
    ActiveRide { ride_id: Uuid, searching: bool },
}

fn active_ride_message(searching: &bool) -> &'static str {
    if *searching {
        "you already have a ride request that is still searching for a driver"
    } else {
        "you already have a ride in progress"
    }
}

impl DispatchError {
    pub fn not_found_ride(ride_id: Uuid) -> Self {
        DispatchError::NotFound(format!("ride {ride_id}"))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "validation",
            DispatchError::NotFound(_) => "not_found",
            DispatchError::Conflict(_) => "conflict",
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::Unauthorized(_) => "unauthorized",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Conflict(conflict) => match conflict {
                Conflict::DriverBusy => "driver_busy",
                Conflict::AlreadyAccepted => "already_accepted",
                Conflict::RideLocked => "ride_locked",
                Conflict::AlreadyCancelled => "already_cancelled",
                Conflict::RideNotAvailable => "ride_not_available",
                Conflict::ActiveRide { searching: true, .. } => "ride_searching",
                Conflict::ActiveRide { searching: false, .. } => "ride_in_progress",
            },
            other => other.kind(),
        }
    }

    /// Body of the `*_error` event sent back to the originating client.
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "success": false,
            "message": self.to_string(),
            "kind": self.kind(),
            "code": self.code(),
        });
        if let DispatchError::Validation(fields) = self {
            payload["fields"] = json!(fields);
        }
        if let DispatchError::Conflict(Conflict::ActiveRide { ride_id, .. }) = self {
            payload["rideId"] = json!(ride_id);
        }
        payload
    }
}

impl From<Conflict> for DispatchError {
    fn from(conflict: Conflict) -> Self {
        DispatchError::Conflict(conflict)
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotFound(_) => AppError::NotFound(err.to_string()),
            DispatchError::Conflict(_) => AppError::Conflict(err.to_string()),
            DispatchError::Validation(_)
            | DispatchError::InvalidTransition { .. }
            | DispatchError::Unauthorized(_) => AppError::BadRequest(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Conflict, DispatchError};
    use crate::models::ride::RideState;

    #[test]
    fn conflict_codes_are_specific() {
        let err: DispatchError = Conflict::RideLocked.into();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(err.code(), "ride_locked");
    }

    #[test]
    fn active_ride_message_distinguishes_searching() {
        let searching = DispatchError::Conflict(Conflict::ActiveRide {
            ride_id: uuid::Uuid::nil(),
            searching: true,
        });
        let in_progress = DispatchError::Conflict(Conflict::ActiveRide {
            ride_id: uuid::Uuid::nil(),
            searching: false,
        });

        assert!(searching.to_string().contains("still searching"));
        assert!(in_progress.to_string().contains("in progress"));
        assert_ne!(searching.code(), in_progress.code());
    }

    #[test]
    fn validation_payload_lists_fields() {
        let err = DispatchError::Validation(vec!["price".into(), "pickup.latitude".into()]);
        let payload = err.to_payload();

        assert_eq!(payload["kind"], "validation");
        assert_eq!(payload["fields"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = DispatchError::InvalidTransition {
            from: RideState::Completed,
            to: RideState::Cancelled,
        };
        assert_eq!(err.to_string(), "invalid transition from completed to cancelled");
    }
}
