use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Active,
    Idle,
    Away,
}

/// One session of a user inside a room. A user may hold several (multi-tab).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    #[serde(rename = "id")]
    pub user_id: String,
    #[serde(rename = "name")]
    pub display_name: String,
    pub session_id: String,
    pub color: String,
    pub status: PresenceStatus,
    #[serde(rename = "lastActivityTime")]
    pub last_activity_ms: i64,
}
