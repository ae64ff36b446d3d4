//! WebSocket upgrade handling: accept, register with the supervisor, and
//! hand the socket to a freshly spawned connection actor.

use crate::actor::{ConnectionActor, INBOX_CAPACITY};
use crate::state::AppState;
use crate::supervisor::RegistryGuard;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Upgrades refused during shutdown still complete the handshake so the
/// client sees a proper close code.
const CLOSE_GOING_AWAY: u16 = 1001;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| accept_connection(socket, state, addr.to_string()))
}

pub async fn accept_connection(mut socket: WebSocket, state: AppState, remote_address: String) {
    if !state.supervisor.is_accepting() {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_GOING_AWAY,
                reason: "server_shutting_down".into(),
            })))
            .await;
        return;
    }

    let connection_id = Uuid::new_v4().to_string();
    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let handle = state
        .supervisor
        .register(&connection_id, &remote_address, inbox_tx.clone());
    info!(connection_id = %connection_id, remote = %remote_address, "client connected");

    let actor = ConnectionActor::new(
        connection_id.clone(),
        remote_address,
        state.clone(),
        handle,
        inbox_tx,
    );
    let supervisor = Arc::clone(&state.supervisor);
    let guard = RegistryGuard {
        supervisor,
        connection_id: connection_id.clone(),
    };
    let join = tokio::spawn(async move {
        // The guard unregisters on every exit path, including panic unwind;
        // a crashing connection never disturbs its siblings.
        let _guard = guard;
        actor.run(socket, inbox_rx).await;
    });
    state.supervisor.attach_join(&connection_id, join);
}
