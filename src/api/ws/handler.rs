use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::ws::hub::{ClientIdentity, ClientKind};
use crate::api::ws::router::{Session, handle_event};
use crate::engine::presence;
use crate::engine::notify::events;
use crate::error::{AppError, DispatchError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

fn identity_from(query: ConnectQuery) -> Result<ClientIdentity, AppError> {
    let kind = query
        .kind
        .as_deref()
        .and_then(ClientKind::parse)
        .ok_or_else(|| AppError::BadRequest("type must be driver or user".to_string()))?;
    let id = query
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("id is required".to_string()))?;
    Ok(ClientIdentity { kind, id })
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let identity = identity_from(query)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, identity)))
}

/// Registers the connection with the hub, then runs presence connect so any
/// backlog lands on the new channel.
pub fn open_session(
    state: &AppState,
    identity: ClientIdentity,
) -> (Session, UnboundedReceiver<Message>) {
    let connection_id = Uuid::new_v4().to_string();
    let rx = state.hub.register(&connection_id, &identity);

    match identity.kind {
        ClientKind::Driver => presence::driver_connected(state, &identity.id, &connection_id),
        ClientKind::Rider => presence::rider_connected(state, &identity.id, &connection_id),
    }

    (
        Session {
            connection_id,
            identity,
        },
        rx,
    )
}

pub fn close_session(state: &AppState, session: &Session) {
    state.hub.remove(&session.connection_id);
    match session.identity.kind {
        ClientKind::Driver => {
            presence::driver_disconnected(state, &session.identity.id, &session.connection_id)
        }
        ClientKind::Rider => {
            presence::rider_disconnected(state, &session.identity.id, &session.connection_id)
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: ClientIdentity) {
    let (session, mut rx) = open_session(&state, identity);
    info!(
        connection_id = %session.connection_id,
        client_id = %session.identity.id,
        kind = ?session.identity.kind,
        "websocket client connected"
    );

    let (mut sink, mut stream) = socket.split();

    let sender_connection = session.connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                debug!(connection_id = %sender_connection, "websocket sink closed");
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<InboundFrame>(&text) {
                Ok(frame) => handle_event(&state, &session, &frame.event, frame.data).await,
                Err(err) => {
                    warn!(connection_id = %session.connection_id, error = %err, "malformed frame");
                    let rejection = DispatchError::Validation(vec!["frame".to_string()]);
                    state.notifier.send_to_client(
                        &session.connection_id,
                        events::ERROR,
                        rejection.to_payload(),
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(connection_id = %session.connection_id, error = %err, "websocket receive error");
                break;
            }
        }
    }

    close_session(&state, &session);
    send_task.abort();
    info!(connection_id = %session.connection_id, "websocket client disconnected");
}
