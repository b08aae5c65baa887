use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Online,
    Busy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverPresence {
    pub driver_id: String,
    pub availability: Availability,
    pub last_seen: DateTime<Utc>,
    pub location: Option<GeoPoint>,
    #[serde(skip)]
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiderPresence {
    pub rider_id: String,
    pub availability: Availability,
    pub last_seen: DateTime<Utc>,
    #[serde(skip)]
    pub connection_id: String,
}
