use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PresenceConfig;
use crate::db::AccessChecker;
use crate::models::{
    ColorUpdatedEvent, ControlFrame, HeartbeatEvent, JoinEvent, LeaveEvent, NodePresenceEvent,
    NodePresenceUpdatedPayload, OutboundMessage, PresenceStatus, PresenceUpdatedPayload, PresenceUser,
};
use crate::validation::{sanitize_color, sanitize_user_name, DEFAULT_COLOR};
use crate::ws::{ConnCtx, ConnId, RoomManager};

#[derive(Default)]
struct PresenceState {
    /// document id -> sessions present in it
    rooms: HashMap<String, Vec<PresenceUser>>,
    /// connection -> (document id, session id) pairs it joined
    conn_sessions: HashMap<ConnId, HashSet<(String, String)>>,
}

impl PresenceState {
    fn session_mut(&mut self, document_id: &str, session_id: &str) -> Option<&mut PresenceUser> {
        self.rooms
            .get_mut(document_id)?
            .iter_mut()
            .find(|u| u.session_id == session_id)
    }

    fn remove_session(&mut self, document_id: &str, session_id: &str) {
        if let Some(users) = self.rooms.get_mut(document_id) {
            users.retain(|u| u.session_id != session_id);
            if users.is_empty() {
                self.rooms.remove(document_id);
            }
        }
    }

    fn users(&self, document_id: &str) -> Vec<PresenceUser> {
        self.rooms.get(document_id).cloned().unwrap_or_default()
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStats {
    pub rooms: usize,
    pub sessions: usize,
    pub users: usize,
}

/// Who is in which document, with what color and activity status
pub struct PresenceService {
    rooms: Arc<RoomManager>,
    access: Arc<dyn AccessChecker>,
    config: PresenceConfig,
    state: Mutex<PresenceState>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceService {
    pub fn new(rooms: Arc<RoomManager>, access: Arc<dyn AccessChecker>, config: PresenceConfig) -> Self {
        Self {
            rooms,
            access,
            config,
            state: Mutex::new(PresenceState::default()),
            sweep_task: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast_presence(&self, document_id: &str, users: Vec<PresenceUser>, exclude: Option<&ConnCtx>) {
        let message = OutboundMessage::PresenceUpdated(PresenceUpdatedPayload {
            document_id: document_id.to_string(),
            users,
        });
        self.rooms.broadcast(document_id, &message, exclude);
    }

    /// Access check for a join. Nothing about the room changes here.
    ///
    /// On denial the caller gets an `authz-error` frame and the socket stays open.
    pub async fn authorize_join(&self, conn: &ConnCtx, event: &JoinEvent) -> bool {
        let Some(user) = conn.user.as_ref() else {
            conn.send_json(&ControlFrame::auth_error());
            return false;
        };
        let document_id = event.header.document_id.as_str();

        match self.access.verify_access(user, document_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("User {} denied access to document {}", user.id, document_id);
                conn.send_json(&ControlFrame::AuthzError {
                    message: format!(
                        "Access denied to chatflow {}. You do not have permission to access this resource.",
                        document_id
                    ),
                });
                return false;
            }
            Err(e) => {
                error!("Access check failed for user {} on document {}: {}", user.id, document_id, e);
                conn.send_json(&ControlFrame::AuthzError {
                    message: "Failed to join chatflow".to_string(),
                });
                return false;
            }
        }
        true
    }

    /// Put an authorized connection in the room and announce it
    pub fn add_to_room(&self, conn: &ConnCtx, event: &JoinEvent) {
        let Some(user) = conn.user.as_ref() else { return };
        let document_id = event.header.document_id.as_str();
        let session_id = event.header.session();

        self.rooms.join(document_id, conn);

        let now = Utc::now().timestamp_millis();
        let name = sanitize_user_name(user.name.as_deref());
        let users = {
            let mut state = self.state();
            match state.session_mut(document_id, session_id) {
                Some(existing) => {
                    existing.display_name = name;
                    existing.color = sanitize_color(event.color.as_deref(), &existing.color);
                    existing.status = PresenceStatus::Active;
                    existing.last_activity_ms = now;
                    debug!("Session {} rejoined document {}", session_id, document_id);
                }
                None => {
                    info!(
                        "User joined - Name: {}, SessionId: {}, DocumentId: {}",
                        name, session_id, document_id
                    );
                    state.rooms.entry(document_id.to_string()).or_default().push(PresenceUser {
                        user_id: user.id.clone(),
                        display_name: name,
                        session_id: session_id.to_string(),
                        color: sanitize_color(event.color.as_deref(), DEFAULT_COLOR),
                        status: PresenceStatus::Active,
                        last_activity_ms: now,
                    });
                }
            }
            state
                .conn_sessions
                .entry(conn.conn_id)
                .or_default()
                .insert((document_id.to_string(), session_id.to_string()));
            state.users(document_id)
        };

        self.broadcast_presence(document_id, users, None);
    }

    pub fn handle_leave(&self, conn: &ConnCtx, event: &LeaveEvent) {
        self.leave_room(conn, event.header.document_id.as_str(), event.header.session());
    }

    pub fn leave_room(&self, conn: &ConnCtx, document_id: &str, session_id: &str) {
        self.rooms.leave(document_id, conn);

        let users = {
            let mut state = self.state();
            state.remove_session(document_id, session_id);
            if let Some(sessions) = state.conn_sessions.get_mut(&conn.conn_id) {
                sessions.remove(&(document_id.to_string(), session_id.to_string()));
                if sessions.is_empty() {
                    state.conn_sessions.remove(&conn.conn_id);
                }
            }
            state.users(document_id)
        };

        self.broadcast_presence(document_id, users, None);
    }

    /// Remove every session the connection holds and tell the affected rooms.
    /// Must run on every socket close. Returns the documents the connection was in.
    pub fn handle_disconnect(&self, conn: &ConnCtx) -> Vec<String> {
        let updates: Vec<(String, Vec<PresenceUser>)> = {
            let mut state = self.state();
            let sessions = state.conn_sessions.remove(&conn.conn_id).unwrap_or_default();
            let mut touched: Vec<String> = Vec::new();
            for (document_id, session_id) in &sessions {
                state.remove_session(document_id, session_id);
                info!("User disconnected: sessionId={}, documentId={}", session_id, document_id);
                if !touched.contains(document_id) {
                    touched.push(document_id.clone());
                }
            }
            touched
                .into_iter()
                .map(|document_id| {
                    let users = state.users(&document_id);
                    (document_id, users)
                })
                .collect()
        };

        let mut left = self.rooms.leave_all_rooms(conn);
        for (document_id, users) in &updates {
            self.broadcast_presence(document_id, users.clone(), None);
            if !left.contains(document_id) {
                left.push(document_id.clone());
            }
        }
        left
    }

    /// Invalid colors keep the session's current color
    pub fn update_user_color(&self, conn: &ConnCtx, event: &ColorUpdatedEvent) {
        let document_id = event.header.document_id.as_str();
        let users = {
            let mut state = self.state();
            let Some(user) = state.session_mut(document_id, event.header.session()) else {
                return;
            };
            user.color = sanitize_color(event.color.as_deref(), &user.color);
            user.status = PresenceStatus::Active;
            user.last_activity_ms = Utc::now().timestamp_millis();
            state.users(document_id)
        };
        self.broadcast_presence(document_id, users, Some(conn));
    }

    pub fn handle_heartbeat(&self, event: &HeartbeatEvent) {
        let document_id = event.header.document_id.as_str();
        let users = {
            let mut state = self.state();
            let Some(user) = state.session_mut(document_id, event.header.session()) else {
                return;
            };
            user.last_activity_ms = Utc::now().timestamp_millis();
            let status = event.status.unwrap_or(PresenceStatus::Active);
            if user.status == status {
                return;
            }
            user.status = status;
            state.users(document_id)
        };
        self.broadcast_presence(document_id, users, None);
    }

    /// Record editing or pointer activity for a session
    pub fn touch(&self, document_id: &str, session_id: &str) {
        let users = {
            let mut state = self.state();
            let Some(user) = state.session_mut(document_id, session_id) else {
                return;
            };
            user.last_activity_ms = Utc::now().timestamp_millis();
            if user.status == PresenceStatus::Active {
                return;
            }
            user.status = PresenceStatus::Active;
            state.users(document_id)
        };
        self.broadcast_presence(document_id, users, None);
    }

    pub fn handle_node_presence(&self, conn: &ConnCtx, event: &NodePresenceEvent) {
        let document_id = event.header.document_id.as_str();
        let payload = {
            let mut state = self.state();
            let Some(user) = state.session_mut(document_id, event.header.session()) else {
                return;
            };
            NodePresenceUpdatedPayload {
                document_id: document_id.to_string(),
                user_id: user.user_id.clone(),
                session_id: user.session_id.clone(),
                action: event.action,
                node_id: event.node_id.clone(),
            }
        };
        self.rooms
            .broadcast(document_id, &OutboundMessage::NodePresenceUpdated(payload), Some(conn));
    }

    /// Demote inactive sessions and broadcast the rooms that changed
    pub fn sweep_idle_at(&self, now_ms: i64) -> Vec<String> {
        let changed: Vec<(String, Vec<PresenceUser>)> = {
            let mut state = self.state();
            let mut changed = Vec::new();
            for (document_id, users) in state.rooms.iter_mut() {
                let mut room_changed = false;
                for user in users.iter_mut() {
                    let elapsed = now_ms - user.last_activity_ms;
                    let next = if elapsed > self.config.away_timeout_ms {
                        PresenceStatus::Away
                    } else if elapsed > self.config.idle_timeout_ms && user.status == PresenceStatus::Active {
                        PresenceStatus::Idle
                    } else {
                        user.status
                    };
                    if next != user.status {
                        user.status = next;
                        room_changed = true;
                    }
                }
                if room_changed {
                    changed.push((document_id.clone(), users.clone()));
                }
            }
            changed
        };

        for (document_id, users) in &changed {
            self.broadcast_presence(document_id, users.clone(), None);
        }
        changed.into_iter().map(|(document_id, _)| document_id).collect()
    }

    pub fn spawn_idle_sweep(self: &Arc<Self>) {
        let service = Arc::downgrade(self);
        let period = self.config.idle_check_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(service) = service.upgrade() else { return };
                let changed = service.sweep_idle_at(Utc::now().timestamp_millis());
                if !changed.is_empty() {
                    debug!("Idle sweep updated presence in {} rooms", changed.len());
                }
            }
        });
        if let Some(previous) = self.sweep_task.lock().unwrap_or_else(PoisonError::into_inner).replace(task) {
            previous.abort();
        }
    }

    pub fn users(&self, document_id: &str) -> Vec<PresenceUser> {
        self.state().users(document_id)
    }

    pub fn stats(&self) -> PresenceStats {
        let state = self.state();
        let users: HashSet<&str> = state
            .rooms
            .values()
            .flat_map(|users| users.iter().map(|u| u.user_id.as_str()))
            .collect();
        PresenceStats {
            rooms: state.rooms.len(),
            sessions: state.rooms.values().map(|users| users.len()).sum(),
            users: users.len(),
        }
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.sweep_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        let mut state = self.state();
        state.rooms.clear();
        state.conn_sessions.clear();
        info!("Presence service shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::{AuthUser, EventHeader, NodePresenceAction};
    use crate::ws::OutgoingFrame;
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::mpsc::UnboundedReceiver;

    const DOC: &str = "11111111-1111-1111-1111-111111111111";

    struct AllowList(Vec<String>);

    #[async_trait]
    impl AccessChecker for AllowList {
        async fn verify_access(&self, user: &AuthUser, _document_id: &str) -> Result<bool, StoreError> {
            Ok(self.0.contains(&user.id))
        }
    }

    fn service() -> PresenceService {
        PresenceService::new(
            Arc::new(RoomManager::new("test")),
            Arc::new(AllowList(vec!["alice".to_string(), "bob".to_string()])),
            PresenceConfig::default(),
        )
    }

    fn connect(user: &str, session: &str) -> (ConnCtx, UnboundedReceiver<OutgoingFrame>) {
        ConnCtx::new(session, Some(AuthUser::new(user, user)))
    }

    fn join(session: &str, color: Option<&str>) -> JoinEvent {
        JoinEvent {
            header: EventHeader::new(DOC, session),
            color: color.map(str::to_string),
        }
    }

    async fn join_room(presence: &PresenceService, conn: &ConnCtx, event: &JoinEvent) -> bool {
        if !presence.authorize_join(conn, event).await {
            return false;
        }
        presence.add_to_room(conn, event);
        true
    }

    fn frames(rx: &mut UnboundedReceiver<OutgoingFrame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(OutgoingFrame::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn join_broadcasts_to_the_joiner_too() {
        let presence = service();
        let (alice, mut rx) = connect("alice", "s1");
        assert!(join_room(&presence, &alice, &join("s1", Some("#ff0000"))).await);

        let got = frames(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["type"], "ON_PRESENCE_UPDATED");
        assert_eq!(got[0]["payload"]["users"][0]["color"], "#ff0000");
        assert_eq!(got[0]["payload"]["users"][0]["status"], "active");
    }

    #[tokio::test]
    async fn denied_join_sends_authz_error_and_keeps_socket() {
        let presence = service();
        let (mallory, mut rx) = connect("mallory", "s9");
        assert!(!join_room(&presence, &mallory, &join("s9", None)).await);

        let got = frames(&mut rx);
        assert_eq!(got[0]["type"], "authz-error");
        assert!(mallory.is_open());
        assert!(presence.users(DOC).is_empty());
    }

    #[tokio::test]
    async fn rejoin_updates_instead_of_duplicating() {
        let presence = service();
        let (alice, _rx) = connect("alice", "s1");
        join_room(&presence, &alice, &join("s1", Some("#123456"))).await;
        presence.sweep_idle_at(Utc::now().timestamp_millis() + 120_000);
        assert_eq!(presence.users(DOC)[0].status, PresenceStatus::Idle);

        join_room(&presence, &alice, &join("s1", Some("bogus"))).await;
        let users = presence.users(DOC);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].status, PresenceStatus::Active);
        assert_eq!(users[0].color, "#123456");
    }

    #[tokio::test]
    async fn invalid_color_update_keeps_previous_color() {
        let presence = service();
        let (alice, _ra) = connect("alice", "s1");
        let (bob, mut rb) = connect("bob", "s2");
        join_room(&presence, &alice, &join("s1", Some("#abcdef"))).await;
        join_room(&presence, &bob, &join("s2", None)).await;
        frames(&mut rb);

        presence.update_user_color(
            &alice,
            &ColorUpdatedEvent {
                header: EventHeader::new(DOC, "s1"),
                color: Some("not-a-color".to_string()),
            },
        );
        let alice_entry = presence.users(DOC).into_iter().find(|u| u.session_id == "s1").unwrap();
        assert_eq!(alice_entry.color, "#abcdef");
        assert_eq!(frames(&mut rb).len(), 1);
    }

    #[tokio::test]
    async fn sweep_moves_active_to_idle_then_away() {
        let presence = service();
        let (alice, _rx) = connect("alice", "s1");
        join_room(&presence, &alice, &join("s1", None)).await;
        let last = presence.users(DOC)[0].last_activity_ms;

        assert!(presence.sweep_idle_at(last + 60_000).is_empty());
        assert_eq!(presence.sweep_idle_at(last + 61_000), vec![DOC.to_string()]);
        assert_eq!(presence.users(DOC)[0].status, PresenceStatus::Idle);

        // Already idle: nothing to report until away
        assert!(presence.sweep_idle_at(last + 200_000).is_empty());
        presence.sweep_idle_at(last + 301_000);
        assert_eq!(presence.users(DOC)[0].status, PresenceStatus::Away);
    }

    #[tokio::test]
    async fn join_activity_uses_server_clock() {
        let presence = service();
        let (alice, _rx) = connect("alice", "s1");
        let mut event = join("s1", None);
        event.header.timestamp = Some(Utc::now().timestamp_millis() - 3_000_000);
        join_room(&presence, &alice, &event).await;

        assert!(presence.sweep_idle_at(Utc::now().timestamp_millis() + 1_000).is_empty());
        assert_eq!(presence.users(DOC)[0].status, PresenceStatus::Active);
    }

    #[tokio::test]
    async fn heartbeat_only_broadcasts_status_changes() {
        let presence = service();
        let (alice, mut rx) = connect("alice", "s1");
        join_room(&presence, &alice, &join("s1", None)).await;
        frames(&mut rx);

        let beat = |status| HeartbeatEvent {
            header: EventHeader::new(DOC, "s1"),
            status,
        };
        presence.handle_heartbeat(&beat(Some(PresenceStatus::Active)));
        assert!(frames(&mut rx).is_empty());

        presence.handle_heartbeat(&beat(Some(PresenceStatus::Away)));
        assert_eq!(frames(&mut rx).len(), 1);
        assert_eq!(presence.users(DOC)[0].status, PresenceStatus::Away);

        presence.touch(DOC, "s1");
        assert_eq!(presence.users(DOC)[0].status, PresenceStatus::Active);
    }

    #[tokio::test]
    async fn disconnect_cleans_every_session_of_the_socket() {
        let presence = service();
        let (alice, _ra) = connect("alice", "s1");
        let (bob, mut rb) = connect("bob", "s2");
        join_room(&presence, &alice, &join("s1", None)).await;
        join_room(&presence, &bob, &join("s2", None)).await;
        frames(&mut rb);

        let left = presence.handle_disconnect(&alice);
        assert_eq!(left, vec![DOC.to_string()]);

        let got = frames(&mut rb);
        assert_eq!(got[0]["payload"]["users"].as_array().unwrap().len(), 1);
        assert_eq!(presence.stats().sessions, 1);

        // Second close is a no-op
        assert!(presence.handle_disconnect(&alice).is_empty());
    }

    #[tokio::test]
    async fn node_presence_goes_to_others_only() {
        let presence = service();
        let (alice, mut ra) = connect("alice", "s1");
        let (bob, mut rb) = connect("bob", "s2");
        join_room(&presence, &alice, &join("s1", None)).await;
        join_room(&presence, &bob, &join("s2", None)).await;
        frames(&mut ra);
        frames(&mut rb);

        presence.handle_node_presence(
            &alice,
            &NodePresenceEvent {
                header: EventHeader::new(DOC, "s1"),
                node_id: "n1".to_string(),
                action: NodePresenceAction::EditStart,
            },
        );
        assert!(frames(&mut ra).is_empty());
        let got = frames(&mut rb);
        assert_eq!(got[0]["payload"]["userId"], "alice");
        assert_eq!(got[0]["payload"]["action"], "edit_start");
    }
}
