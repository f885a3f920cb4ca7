use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::models::AuthUser;

pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Frames queued for the socket writer task
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Handle to one live client connection.
///
/// Cheap to clone; every clone writes into the same outgoing queue.
#[derive(Clone, Debug)]
pub struct ConnCtx {
    pub conn_id: ConnId,
    pub session_id: String,
    pub user: Option<AuthUser>,
    tx: mpsc::UnboundedSender<OutgoingFrame>,
}

impl ConnCtx {
    pub fn new(session_id: impl Into<String>, user: Option<AuthUser>) -> (Self, mpsc::UnboundedReceiver<OutgoingFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            session_id: session_id.into(),
            user,
            tx,
        };
        (conn, rx)
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn user_id(&self) -> &str {
        self.user.as_ref().map(|u| u.id.as_str()).unwrap_or("anonymous")
    }

    /// Queue a raw text frame. Returns false once the socket is gone.
    pub fn send_text(&self, text: String) -> bool {
        if self.tx.send(OutgoingFrame::Text(text)).is_err() {
            debug!("Connection {} closed, dropping frame", self.conn_id);
            return false;
        }
        true
    }

    pub fn send_json<T: Serialize>(&self, msg: &T) -> bool {
        match serde_json::to_string(msg) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                error!("Failed to serialize frame for connection {}: {}", self.conn_id, e);
                false
            }
        }
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(OutgoingFrame::Close {
            code,
            reason: reason.into(),
        });
    }
}

impl PartialEq for ConnCtx {
    fn eq(&self, other: &Self) -> bool {
        self.conn_id == other.conn_id
    }
}

impl Eq for ConnCtx {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_frames_queue_in_order() {
        let (a, mut rx) = ConnCtx::new("s1", None);
        let (b, _rx_b) = ConnCtx::new("s2", None);
        assert_ne!(a.conn_id, b.conn_id);
        assert!(!a.is_authenticated());

        assert!(a.send_text("one".to_string()));
        a.close(1000, "bye");
        assert_eq!(rx.try_recv().unwrap(), OutgoingFrame::Text("one".to_string()));
        assert_eq!(
            rx.try_recv().unwrap(),
            OutgoingFrame::Close { code: 1000, reason: "bye".to_string() }
        );

        drop(rx);
        assert!(!a.is_open());
        assert!(!a.send_text("late".to_string()));
    }
}
