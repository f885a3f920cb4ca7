use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        RawQuery, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::auth::auth::{get_auth_token, get_session_id};
use crate::models::{AuthUser, ControlFrame};
use crate::ws::{ConnCtx, OutgoingFrame, RateDecision};

pub const CLOSE_UNAUTHORIZED: u16 = 4401;
pub const CLOSE_TOO_MANY_CONNECTIONS: u16 = 4429;

/// WebSocket handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let token = get_auth_token(&headers, query.as_deref());
    let user = match app.authenticator.authenticate(token.as_deref()) {
        Ok(user) => Some(user),
        Err(e) => {
            warn!("WebSocket authentication failed: {}", e);
            None
        }
    };
    let session_id = get_session_id(&headers);
    info!("New WebSocket connection attempt, session {}", session_id);
    ws.on_upgrade(move |socket| handle_socket(socket, app, user, session_id))
}

/// Drain the connection's outgoing queue into the socket
async fn write_frames(mut sender: futures_util::stream::SplitSink<WebSocket, Message>, mut outgoing: UnboundedReceiver<OutgoingFrame>) {
    while let Some(frame) = outgoing.recv().await {
        match frame {
            OutgoingFrame::Text(text) => {
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            OutgoingFrame::Close { code, reason } => {
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, app: AppState, user: Option<AuthUser>, session_id: String) {
    let (sender, mut receiver) = socket.split();
    let (conn, outgoing) = ConnCtx::new(session_id, user);
    let mut send_task = tokio::spawn(write_frames(sender, outgoing));

    if !conn.is_authenticated() {
        conn.send_json(&ControlFrame::auth_error());
        conn.close(CLOSE_UNAUTHORIZED, "Unauthorized");
        let _ = send_task.await;
        return;
    }

    if let Err(e) = app.pool.add_connection(&conn) {
        warn!("Connection rejected for user {}: {}", conn.user_id(), e);
        conn.send_json(&ControlFrame::ConnectionError { message: e.to_string() });
        conn.close(CLOSE_TOO_MANY_CONNECTIONS, "Too Many Connections");
        let _ = send_task.await;
        return;
    }

    info!(
        "WebSocket connection established: user={}, session={}, connection={}",
        conn.user_id(),
        conn.session_id,
        conn.conn_id
    );
    conn.send_json(&ControlFrame::ConnectionEstablished {
        session_id: conn.session_id.clone(),
        user_id: conn.user_id().to_string(),
    });

    let reader_conn = conn.clone();
    let reader_app = app.clone();
    let mut recv_task = tokio::spawn(async move {
        let conn = reader_conn;
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let RateDecision::Limited { retry_after } = reader_app.pool.check_rate_limit(conn.conn_id) {
                        conn.send_json(&ControlFrame::RateLimitExceeded {
                            message: "Rate limit exceeded. Please slow down.".to_string(),
                            retry_after,
                        });
                        continue;
                    }
                    reader_app.router.handle_text(&conn, &text).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Binary(_)) => debug!("Ignoring binary frame on connection {}", conn.conn_id),
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket error on connection {}: {}", conn.conn_id, e);
                    break;
                }
            }
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    app.pool.remove_connection(conn.conn_id);
    app.router.handle_disconnect(&conn);
    info!(
        "WebSocket connection terminated: session={}, connection={}",
        conn.session_id, conn.conn_id
    );
}
