use std::fmt;

use serde_json::Value;

/// Broadcast groups understood by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Group {
    Drivers,
    Driver(String),
    Rider(String),
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::Drivers => f.write_str("drivers"),
            Group::Driver(id) => write!(f, "driver:{id}"),
            Group::Rider(id) => write!(f, "rider:{id}"),
        }
    }
}

/// Outbound side of the session layer.
///
/// Sends are fire-and-forget and must not block: the engine calls these
/// while holding per-ride locks.
pub trait Notifier: Send + Sync {
    fn send_to_client(&self, connection_id: &str, event: &str, payload: Value);

    fn send_to_group(&self, group: &Group, event: &str, payload: Value);
}

pub mod events {
    pub const RIDE_REQUEST_CREATED: &str = "ride_request_created";
    pub const NEW_RIDE_REQUEST: &str = "new_ride_request";
    pub const ACTIVE_RIDE_REQUESTS: &str = "active_ride_requests";
    pub const RIDE_ACCEPTED: &str = "ride_accepted";
    pub const RIDE_ACCEPTED_WITH_DETAILS: &str = "ride_accepted_with_details";
    pub const RIDE_TAKEN: &str = "ride_taken";
    pub const RIDE_STATUS_UPDATE: &str = "ride_status_update";
    pub const RIDE_COMPLETED: &str = "ride_completed";
    pub const RIDE_CANCELLED: &str = "ride_cancelled";
    pub const RIDE_EXPIRED: &str = "ride_expired";
    pub const ACTIVE_RIDE: &str = "active_ride";
    pub const DRIVER_LOCATION_UPDATE: &str = "driver_location_update";
    pub const DRIVER_DISCONNECTED: &str = "driver_disconnected";
    pub const RIDE_REJECTED: &str = "ride_rejected";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
}
