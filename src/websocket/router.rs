use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::{CollabError, CollabResult};
use crate::models::{ControlFrame, GraphMutation, InboundEvent};
use crate::services::{CollabService, PresenceService};
use crate::validation::{
    check_message_size, is_valid_document_id, is_valid_entity_id, is_valid_session_id, sanitize_timestamp,
};
use crate::ws::{ConnCtx, RoomManager};

/// Turn a failed event into the frame the client sees.
/// Internal failures only ever surface as a generic error.
pub fn error_frame(err: &CollabError) -> ControlFrame {
    match err {
        CollabError::Authentication => ControlFrame::auth_error(),
        CollabError::Authorization { document_id } => ControlFrame::AuthzError {
            message: format!(
                "Access denied to chatflow {}. You do not have permission to access this resource.",
                document_id
            ),
        },
        CollabError::Validation { message, .. } => ControlFrame::validation_error(message.clone()),
        CollabError::DocumentNotFound(_) => ControlFrame::Error {
            message: "Chatflow not found".to_string(),
        },
        _ => ControlFrame::Error {
            message: "Internal server error".to_string(),
        },
    }
}

/// Validates inbound frames and dispatches them to presence or the orchestrator
pub struct EventRouter {
    rooms: Arc<RoomManager>,
    presence: Arc<PresenceService>,
    collab: Arc<CollabService>,
    max_message_bytes: usize,
}

impl EventRouter {
    pub fn new(
        rooms: Arc<RoomManager>,
        presence: Arc<PresenceService>,
        collab: Arc<CollabService>,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            rooms,
            presence,
            collab,
            max_message_bytes,
        }
    }

    /// Handle one text frame from a connection. Never fails the connection.
    pub async fn handle_text(&self, conn: &ConnCtx, raw: &str) {
        let size = check_message_size(raw.len(), self.max_message_bytes);
        if !size.is_valid {
            warn!("Message from connection {} too large: {} bytes", conn.conn_id, size.size);
            conn.send_json(&ControlFrame::validation_error(format!(
                "Message too large: {} bytes (max {})",
                size.size, size.max_size
            )));
            return;
        }

        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                debug!("Unparseable message from connection {}: {}", conn.conn_id, e);
                conn.send_json(&ControlFrame::Error {
                    message: "Invalid message format".to_string(),
                });
                return;
            }
        };

        if !conn.is_authenticated() {
            conn.send_json(&ControlFrame::auth_error());
            return;
        }

        let event_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
        if !InboundEvent::is_known_type(event_type) {
            warn!("Unknown event type '{}' from connection {}", event_type, conn.conn_id);
            return;
        }

        let result = match self.parse(conn, value) {
            Ok(event) => self.dispatch(conn, event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            match &e {
                CollabError::Authentication | CollabError::Authorization { .. } | CollabError::Validation { .. } => {
                    debug!("Rejected event from connection {}: {}", conn.conn_id, e)
                }
                _ => error!("Error handling event from connection {}: {}", conn.conn_id, e),
            }
            conn.send_json(&error_frame(&e));
        }
    }

    /// Typed parse, then fill and validate the common fields
    fn parse(&self, conn: &ConnCtx, value: Value) -> CollabResult<InboundEvent> {
        let mut event: InboundEvent =
            serde_json::from_value(value).map_err(|e| CollabError::validation("message", e.to_string()))?;

        let header = event.header_mut();
        if !is_valid_document_id(&header.document_id) {
            return Err(CollabError::validation("chatflowId", "Invalid chatflowId format"));
        }
        match header.session_id.as_deref().map(is_valid_session_id) {
            None => header.session_id = Some(conn.session_id.clone()),
            Some(false) => return Err(CollabError::validation("sessionId", "Invalid sessionId format")),
            Some(true) if header.session() != conn.session_id => {
                return Err(CollabError::validation("sessionId", "sessionId does not match the connection"));
            }
            Some(true) => {}
        }
        header.timestamp = Some(sanitize_timestamp(header.timestamp, Utc::now().timestamp_millis()));

        let entity_id = match &event {
            InboundEvent::NodeUpdated(e) => Some(("node.id", e.node.id.as_str())),
            InboundEvent::EdgeUpdated(e) => Some(("edge.id", e.edge.id.as_str())),
            InboundEvent::NodePresenceUpdated(e) => Some(("nodeId", e.node_id.as_str())),
            _ => None,
        };
        if let Some((field, id)) = entity_id {
            if !is_valid_entity_id(id) {
                return Err(CollabError::validation(field, format!("Invalid {} format", field)));
            }
        }
        Ok(event)
    }

    fn require_member(&self, conn: &ConnCtx, document_id: &str) -> CollabResult<()> {
        if self.rooms.is_member(document_id, conn) {
            Ok(())
        } else {
            Err(CollabError::Authorization {
                document_id: document_id.to_string(),
            })
        }
    }

    async fn dispatch(&self, conn: &ConnCtx, event: InboundEvent) -> CollabResult<()> {
        let document_id = event.header().document_id.clone();
        let session_id = event.header().session().to_string();

        match event {
            InboundEvent::Join(e) => {
                if !self.presence.authorize_join(conn, &e).await {
                    return Ok(());
                }
                // A document that cannot be loaded fails the join before anyone sees the session
                self.collab.state().get_flow_data(&document_id).await?;
                self.presence.add_to_room(conn, &e);
                if let Err(err) = self.collab.send_snapshot_to_user(conn, &document_id).await {
                    self.presence.leave_room(conn, &document_id, &session_id);
                    return Err(err);
                }
            }
            InboundEvent::Leave(e) => {
                self.presence.handle_leave(conn, &e);
                self.collab.remove_snapshot_if_empty(&document_id);
            }
            InboundEvent::ColorUpdated(e) => {
                self.require_member(conn, &document_id)?;
                self.presence.update_user_color(conn, &e);
            }
            InboundEvent::Heartbeat(e) => {
                self.presence.handle_heartbeat(&e);
            }
            InboundEvent::SnapshotRequest(_) => {
                self.require_member(conn, &document_id)?;
                self.collab.broadcast_snapshot_to_others(conn, &document_id).await?;
            }
            InboundEvent::NodeUpdated(e) => {
                self.require_member(conn, &document_id)?;
                self.presence.touch(&document_id, &session_id);
                self.collab.handle_remote_change(conn, &GraphMutation::Node(e)).await?;
            }
            InboundEvent::EdgeUpdated(e) => {
                self.require_member(conn, &document_id)?;
                self.presence.touch(&document_id, &session_id);
                self.collab.handle_remote_change(conn, &GraphMutation::Edge(e)).await?;
            }
            InboundEvent::CursorMoved(e) => {
                self.require_member(conn, &document_id)?;
                self.presence.touch(&document_id, &session_id);
                self.collab.handle_cursor_move(conn, &e);
            }
            InboundEvent::NodePresenceUpdated(e) => {
                self.require_member(conn, &document_id)?;
                self.presence.handle_node_presence(conn, &e);
            }
        }
        Ok(())
    }

    /// Socket closed: drop presence everywhere and evict snapshots of rooms left empty
    pub fn handle_disconnect(&self, conn: &ConnCtx) {
        let documents = self.presence.handle_disconnect(conn);
        for document_id in &documents {
            if self.collab.remove_snapshot_if_empty(document_id) {
                debug!("Evicted snapshot of {} after last local connection left", document_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PresenceConfig, StateConfig};
    use crate::db::{InMemoryEventLog, InMemoryStore, ScopeAccessChecker};
    use crate::models::{AuthUser, StoredDocument};
    use crate::services::DocStateService;
    use crate::ws::OutgoingFrame;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const DOC: &str = "11111111-1111-1111-1111-111111111111";
    const OTHER_DOC: &str = "22222222-2222-2222-2222-222222222222";

    struct Fixture {
        store: Arc<InMemoryStore>,
        rooms: Arc<RoomManager>,
        presence: Arc<PresenceService>,
        state: Arc<DocStateService>,
        router: EventRouter,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        store.insert(StoredDocument {
            id: DOC.to_string(),
            scope_id: "ws-1".to_string(),
            flow_data: json!({"nodes": [], "edges": []}).to_string(),
        });
        store.insert(StoredDocument {
            id: OTHER_DOC.to_string(),
            scope_id: "ws-other".to_string(),
            flow_data: json!({"nodes": [], "edges": []}).to_string(),
        });
        let rooms = Arc::new(RoomManager::new("test"));
        let access = Arc::new(ScopeAccessChecker::new(store.clone(), Duration::from_secs(60)));
        let presence = Arc::new(PresenceService::new(rooms.clone(), access, PresenceConfig::default()));
        let state = Arc::new(DocStateService::new(store.clone(), StateConfig::default()));
        let collab = Arc::new(CollabService::new(
            rooms.clone(),
            state.clone(),
            Arc::new(InMemoryEventLog::new()),
        ));
        let router = EventRouter::new(rooms.clone(), presence.clone(), collab, 4096);
        Fixture {
            store,
            rooms,
            presence,
            state,
            router,
        }
    }

    fn user_conn(session: &str) -> (ConnCtx, UnboundedReceiver<OutgoingFrame>) {
        ConnCtx::new(session, Some(AuthUser::new(session, session).with_workspace("ws-1")))
    }

    fn drain(rx: &mut UnboundedReceiver<OutgoingFrame>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(OutgoingFrame::Text(text)) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    fn types(frames: &[Value]) -> Vec<&str> {
        frames.iter().map(|f| f["type"].as_str().unwrap_or_default()).collect()
    }

    fn join(doc: &str) -> String {
        json!({"type": "JOIN_CHAT_FLOW", "chatflowId": doc}).to_string()
    }

    #[tokio::test]
    async fn malformed_and_unauthenticated_frames_are_rejected() {
        let f = fixture();
        let (anon, mut rx) = ConnCtx::new("anon", None);

        f.router.handle_text(&anon, "{not json").await;
        f.router.handle_text(&anon, &join(DOC)).await;
        let frames = drain(&mut rx);
        assert_eq!(frames[0], json!({"type": "error", "message": "Invalid message format"}));
        assert_eq!(frames[1]["type"], "auth-error");
        assert!(f.rooms.is_room_empty(DOC));
    }

    #[tokio::test]
    async fn unknown_types_are_dropped_silently() {
        let f = fixture();
        let (conn, mut rx) = user_conn("s1");
        f.router.handle_text(&conn, &json!({"type": "SOMETHING_ELSE"}).to_string()).await;
        assert!(drain(&mut rx).is_empty());
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn invalid_fields_produce_validation_errors() {
        let f = fixture();
        let (conn, mut rx) = user_conn("s1");

        f.router.handle_text(&conn, &join("not-a-uuid")).await;
        f.router
            .handle_text(&conn, &json!({"type": "JOIN_CHAT_FLOW", "chatflowId": DOC, "sessionId": "bad id!"}).to_string())
            .await;
        f.router
            .handle_text(&conn, &json!({"type": "LEAVE_CHAT_FLOW", "chatflowId": DOC, "sessionId": "s2"}).to_string())
            .await;
        f.router.handle_text(&conn, &"x".repeat(5000)).await;
        f.router.handle_text(&conn, &json!({"type": "CURSOR_MOVED", "chatflowId": DOC}).to_string()).await;

        let frames = drain(&mut rx);
        assert_eq!(types(&frames), vec!["validation-error"; 5]);
        assert_eq!(frames[0]["message"], "Invalid chatflowId format");
        assert!(f.rooms.is_room_empty(DOC));
    }

    #[tokio::test]
    async fn join_sends_presence_and_snapshot() {
        let f = fixture();
        let (conn, mut rx) = user_conn("s1");
        f.router.handle_text(&conn, &join(DOC)).await;

        let frames = drain(&mut rx);
        assert_eq!(types(&frames), vec!["ON_PRESENCE_UPDATED", "ON_SNAPSHOT_SYNC"]);
        assert_eq!(frames[0]["payload"]["users"][0]["sessionId"], "s1");
        assert!(f.rooms.is_member(DOC, &conn));
    }

    #[tokio::test]
    async fn join_outside_scope_is_denied() {
        let f = fixture();
        let (conn, mut rx) = user_conn("s1");
        f.router.handle_text(&conn, &join(OTHER_DOC)).await;

        let frames = drain(&mut rx);
        assert_eq!(types(&frames), vec!["authz-error"]);
        assert!(f.rooms.is_room_empty(OTHER_DOC));
        assert!(!f.state.has_snapshot(OTHER_DOC));
    }

    #[tokio::test]
    async fn join_of_unloadable_document_leaves_no_trace() {
        let f = fixture();
        let (conn, mut rx) = user_conn("s1");
        f.router.handle_text(&conn, &join(DOC)).await;
        f.router
            .handle_text(&conn, &json!({"type": "LEAVE_CHAT_FLOW", "chatflowId": DOC}).to_string())
            .await;
        assert!(!f.state.has_snapshot(DOC));
        drain(&mut rx);

        // Access is still cached, but the row is gone
        f.store.delete(DOC);
        f.router.handle_text(&conn, &join(DOC)).await;

        let frames = drain(&mut rx);
        assert_eq!(frames, vec![json!({"type": "error", "message": "Chatflow not found"})]);
        assert!(!f.rooms.is_member(DOC, &conn));
        assert!(f.presence.users(DOC).is_empty());
    }

    #[tokio::test]
    async fn mutations_require_room_membership() {
        let f = fixture();
        let (conn, mut rx) = user_conn("s1");
        let update = json!({
            "type": "NODE_UPDATED",
            "chatflowId": DOC,
            "changeType": "add",
            "node": {"id": "n1"}
        })
        .to_string();

        f.router.handle_text(&conn, &update).await;
        assert_eq!(types(&drain(&mut rx)), vec!["authz-error"]);
        assert!(!f.state.is_dirty(DOC));

        f.router.handle_text(&conn, &join(DOC)).await;
        drain(&mut rx);
        f.router.handle_text(&conn, &update).await;
        assert!(drain(&mut rx).is_empty());
        assert!(f.state.is_dirty(DOC));
    }

    #[tokio::test]
    async fn disconnect_clears_rooms_presence_and_clean_snapshots() {
        let f = fixture();
        let (a, _ra) = user_conn("s1");
        let (b, mut rb) = user_conn("s2");
        f.router.handle_text(&a, &join(DOC)).await;
        f.router.handle_text(&b, &join(DOC)).await;
        drain(&mut rb);

        f.router.handle_disconnect(&a);
        let frames = drain(&mut rb);
        assert_eq!(types(&frames), vec!["ON_PRESENCE_UPDATED"]);
        assert_eq!(frames[0]["payload"]["users"].as_array().unwrap().len(), 1);
        assert!(f.state.has_snapshot(DOC));

        f.router.handle_disconnect(&b);
        assert!(f.rooms.is_room_empty(DOC));
        assert!(!f.state.has_snapshot(DOC));
    }
}
