//! Fixtures shared by the engine unit tests.

use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::api::ws::handler::{close_session, open_session};
use crate::api::ws::{ClientIdentity, Session};
use crate::config::Config;
use crate::engine::state_machine::{TransitionPatch, transition};
use crate::models::ride::{Place, Ride, RideState, VerificationCode};
use crate::state::AppState;

pub const TEST_CODE: &str = "4821";

pub fn test_state() -> Arc<AppState> {
    Arc::new(AppState::new(&Config::default()))
}

pub fn place(latitude: f64, longitude: f64) -> Place {
    Place {
        latitude,
        longitude,
        address: None,
        name: None,
        external_id: None,
        category: None,
    }
}

pub fn searching_ride(state: &AppState, rider_id: &str) -> Ride {
    let now = Utc::now();
    let ride = Ride {
        id: Uuid::new_v4(),
        rider_id: rider_id.to_string(),
        pickup: place(17.4448, 78.3498),
        drop: place(17.3850, 78.4867),
        ride_type: "Mini".to_string(),
        price: 150.0,
        state: RideState::Searching,
        created_at: now,
        updated_at: now,
        driver_id: None,
        driver: None,
        accepted_at: None,
        arrived_at: None,
        started_at: None,
        completed_at: None,
        distance: None,
        duration: None,
        cancellation: None,
        verification: None,
    };
    state
        .rides
        .insert_for_rider(ride.clone())
        .expect("rider has no open ride");
    ride
}

/// A ride already accepted by `driver_id` with [`TEST_CODE`] issued.
pub fn accepted_ride(state: &AppState, rider_id: &str, driver_id: &str) -> Ride {
    let ride = searching_ride(state, rider_id);
    let patch = TransitionPatch {
        driver_id: Some(driver_id.to_string()),
        verification: Some(VerificationCode {
            code: TEST_CODE.to_string(),
            issued_at: Utc::now(),
        }),
        ..Default::default()
    };
    transition(state, ride.id, RideState::Accepted, patch)
        .expect("searching ride accepts")
        .ride
}

pub fn move_to(state: &AppState, ride_id: Uuid, to: RideState) -> Ride {
    transition(state, ride_id, to, TransitionPatch::default())
        .expect("legal transition")
        .ride
}

pub struct TestClient {
    pub session: Session,
    rx: UnboundedReceiver<Message>,
    received: Vec<(String, Value)>,
}

impl TestClient {
    fn pump(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            if let Message::Text(text) = message {
                let frame: Value = serde_json::from_str(&text).expect("json frame");
                let event = frame["event"].as_str().unwrap_or_default().to_string();
                self.received.push((event, frame["data"].clone()));
            }
        }
    }

    pub fn payloads(&mut self, event: &str) -> Vec<Value> {
        self.pump();
        self.received
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn events(&mut self) -> Vec<String> {
        self.pump();
        self.received.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn disconnect(self, state: &AppState) {
        close_session(state, &self.session);
    }
}

fn connect(state: &AppState, identity: ClientIdentity) -> TestClient {
    let (session, rx) = open_session(state, identity);
    TestClient {
        session,
        rx,
        received: Vec::new(),
    }
}

pub fn connect_driver(state: &AppState, driver_id: &str) -> TestClient {
    connect(state, ClientIdentity::driver(driver_id))
}

pub fn connect_rider(state: &AppState, rider_id: &str) -> TestClient {
    connect(state, ClientIdentity::rider(rider_id))
}
