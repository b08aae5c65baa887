#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use ride_dispatch::api::ws::handler::{close_session, open_session};
use ride_dispatch::api::ws::{ClientIdentity, Session};
use ride_dispatch::config::{Config, DispatchTimeouts};
use ride_dispatch::state::AppState;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn setup() -> Arc<AppState> {
    Arc::new(AppState::new(&Config::default()))
}

pub fn setup_with_search_timeout(search_timeout: Duration) -> Arc<AppState> {
    let config = Config {
        timeouts: DispatchTimeouts {
            search_timeout,
            ..DispatchTimeouts::default()
        },
        ..Config::default()
    };
    Arc::new(AppState::new(&config))
}

pub struct Client {
    pub session: Session,
    rx: UnboundedReceiver<Message>,
    received: Vec<(String, Value)>,
}

impl Client {
    pub fn driver(state: &AppState, id: &str) -> Self {
        Self::connect(state, ClientIdentity::driver(id))
    }

    pub fn rider(state: &AppState, id: &str) -> Self {
        Self::connect(state, ClientIdentity::rider(id))
    }

    fn connect(state: &AppState, identity: ClientIdentity) -> Self {
        let (session, rx) = open_session(state, identity);
        Self {
            session,
            rx,
            received: Vec::new(),
        }
    }

    fn pump(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            if let Message::Text(text) = message {
                let frame: Value = serde_json::from_str(&text).unwrap();
                let event = frame["event"].as_str().unwrap().to_string();
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

    pub fn last(&mut self, event: &str) -> Value {
        self.payloads(event)
            .pop()
            .unwrap_or_else(|| panic!("no {event} received"))
    }

    pub fn close(self, state: &AppState) {
        close_session(state, &self.session);
    }
}

pub fn ride_request(rider_id: &str, price: f64) -> Value {
    json!({
        "pickup": {
            "latitude": 28.6139,
            "longitude": 77.2090,
            "address": "New Delhi, India",
            "name": "Pickup Location"
        },
        "drop": {
            "latitude": 28.7041,
            "longitude": 77.1025,
            "address": "Delhi Airport",
            "name": "Delhi Airport",
            "id": "airport_1",
            "type": "airport"
        },
        "rideType": "Bike",
        "price": price,
        "userId": rider_id
    })
}
