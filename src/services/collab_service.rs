use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use super::doc_state_service::DocStateService;
use super::merge::MergeOutcome;
use crate::db::EventLog;
use crate::error::{CollabError, CollabResult};
use crate::models::{
    CursorMovedEvent, CursorMovedPayload, GraphMutation, OutboundMessage, RemoteChangePayload, SnapshotSyncPayload,
};
use crate::validation::{sanitize_color, sanitize_coordinate, sanitize_user_name, DEFAULT_COLOR};
use crate::ws::{ConnCtx, RoomManager};

/// Ties document state to room fan-out
pub struct CollabService {
    rooms: Arc<RoomManager>,
    state: Arc<DocStateService>,
    events: Arc<dyn EventLog>,
}

impl CollabService {
    pub fn new(rooms: Arc<RoomManager>, state: Arc<DocStateService>, events: Arc<dyn EventLog>) -> Self {
        Self { rooms, state, events }
    }

    pub fn state(&self) -> &Arc<DocStateService> {
        &self.state
    }

    async fn snapshot_message(&self, document_id: &str) -> CollabResult<OutboundMessage> {
        let snapshot = self.state.get_flow_data(document_id).await?;
        Ok(OutboundMessage::SnapshotSync(SnapshotSyncPayload {
            document_id: document_id.to_string(),
            snapshot,
        }))
    }

    /// Send the current snapshot to one connection only
    pub async fn send_snapshot_to_user(&self, conn: &ConnCtx, document_id: &str) -> CollabResult<()> {
        let message = self.snapshot_message(document_id).await?;
        conn.send_json(&message);
        Ok(())
    }

    /// Push the current snapshot to everyone else in the room (idle-client resync)
    pub async fn broadcast_snapshot_to_others(&self, conn: &ConnCtx, document_id: &str) -> CollabResult<usize> {
        let message = self.snapshot_message(document_id).await?;
        Ok(self.rooms.broadcast(document_id, &message, Some(conn)))
    }

    /// Audit, merge, then tell the rest of the room about the changed entity.
    ///
    /// Stale mutations are merged away silently and not rebroadcast.
    pub async fn handle_remote_change(&self, conn: &ConnCtx, mutation: &GraphMutation) -> CollabResult<MergeOutcome> {
        let actor = conn.user.as_ref().ok_or(CollabError::Authentication)?;
        let document_id = mutation.document_id();

        let record = serde_json::to_value(mutation.to_event())?;
        if let Err(e) = self.events.append(document_id, record).await {
            warn!("Failed to append audit event for document {}: {}", document_id, e);
        }

        let outcome = self.state.apply_event(mutation, actor).await?;
        if outcome == MergeOutcome::Stale {
            return Ok(outcome);
        }

        let payload = match mutation {
            GraphMutation::Node(e) => RemoteChangePayload {
                document_id: document_id.to_string(),
                change_type: e.change_type.as_str().to_string(),
                node: Some(e.node.clone()),
                edge: None,
            },
            GraphMutation::Edge(e) => RemoteChangePayload {
                document_id: document_id.to_string(),
                change_type: e.change_type.as_str().to_string(),
                node: None,
                edge: Some(e.edge.clone()),
            },
        };
        let delivered = self
            .rooms
            .broadcast(document_id, &OutboundMessage::RemoteChange(payload), Some(conn));
        debug!(
            "Change to {} in document {} delivered to {} local connections",
            mutation.entity_id(),
            document_id,
            delivered
        );
        Ok(outcome)
    }

    /// Ephemeral pointer fan-out, nothing is stored
    pub fn handle_cursor_move(&self, conn: &ConnCtx, event: &CursorMovedEvent) -> usize {
        let payload = CursorMovedPayload {
            document_id: event.header.document_id.clone(),
            x: sanitize_coordinate(event.x),
            y: sanitize_coordinate(event.y),
            name: sanitize_user_name(event.name.as_deref()),
            color: sanitize_color(event.color.as_deref(), DEFAULT_COLOR),
            session_id: event.header.session().to_string(),
            timestamp: Utc::now().timestamp_millis(),
        };
        self.rooms
            .broadcast(&event.header.document_id, &OutboundMessage::CursorMoved(payload), Some(conn))
    }

    /// Evict the snapshot once nobody on this instance is left in the room
    pub fn remove_snapshot_if_empty(&self, document_id: &str) -> bool {
        if !self.rooms.is_room_empty(document_id) {
            return false;
        }
        self.state.remove_snapshot(document_id)
    }
}
