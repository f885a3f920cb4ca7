use serde::{Deserialize, Serialize};

use crate::models::{FlowData, FlowEdge, FlowNode, PresenceStatus, PresenceUser};

/// Fields shared by every inbound event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    #[serde(alias = "chatflowId")]
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl EventHeader {
    pub fn new(document_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            session_id: Some(session_id.into()),
            timestamp: None,
        }
    }

    /// Session id after routing; the router fills it from the connection when absent.
    pub fn session(&self) -> &str {
        self.session_id.as_deref().unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaveEvent {
    #[serde(flatten)]
    pub header: EventHeader,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ColorUpdatedEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(default)]
    pub status: Option<PresenceStatus>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequestEvent {
    #[serde(flatten)]
    pub header: EventHeader,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeChangeType {
    Add,
    Remove,
    Update,
    Position,
    Dimensions,
    Select,
    #[serde(other)]
    Other,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EdgeChangeType {
    Add,
    Remove,
    Update,
    Buttonedge,
    #[serde(other)]
    Other,
}

impl NodeChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeChangeType::Add => "add",
            NodeChangeType::Remove => "remove",
            NodeChangeType::Update => "update",
            NodeChangeType::Position => "position",
            NodeChangeType::Dimensions => "dimensions",
            NodeChangeType::Select => "select",
            NodeChangeType::Other => "other",
        }
    }
}

impl EdgeChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeChangeType::Add => "add",
            EdgeChangeType::Remove => "remove",
            EdgeChangeType::Update => "update",
            EdgeChangeType::Buttonedge => "buttonedge",
            EdgeChangeType::Other => "other",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdatedEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub change_type: NodeChangeType,
    pub node: FlowNode,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeUpdatedEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub change_type: EdgeChangeType,
    pub edge: FlowEdge,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CursorMovedEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodePresenceAction {
    Enter,
    Leave,
    EditStart,
    EditEnd,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePresenceEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub node_id: String,
    pub action: NodePresenceAction,
}

/// A node or edge mutation, the unit the document state merges
#[derive(Debug, Clone, PartialEq)]
pub enum GraphMutation {
    Node(NodeUpdatedEvent),
    Edge(EdgeUpdatedEvent),
}

impl GraphMutation {
    pub fn header(&self) -> &EventHeader {
        match self {
            GraphMutation::Node(e) => &e.header,
            GraphMutation::Edge(e) => &e.header,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.header().document_id
    }

    pub fn entity_id(&self) -> &str {
        match self {
            GraphMutation::Node(e) => &e.node.id,
            GraphMutation::Edge(e) => &e.edge.id,
        }
    }

    /// The raw event, as written to the audit log
    pub fn to_event(&self) -> InboundEvent {
        match self {
            GraphMutation::Node(e) => InboundEvent::NodeUpdated(e.clone()),
            GraphMutation::Edge(e) => InboundEvent::EdgeUpdated(e.clone()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "JOIN_CHAT_FLOW")]
    Join(JoinEvent),
    #[serde(rename = "LEAVE_CHAT_FLOW")]
    Leave(LeaveEvent),
    #[serde(rename = "USER_COLOR_UPDATED")]
    ColorUpdated(ColorUpdatedEvent),
    #[serde(rename = "USER_HEARTBEAT")]
    Heartbeat(HeartbeatEvent),
    #[serde(rename = "REQUEST_SNAPSHOT_SYNC")]
    SnapshotRequest(SnapshotRequestEvent),
    #[serde(rename = "NODE_UPDATED")]
    NodeUpdated(NodeUpdatedEvent),
    #[serde(rename = "EDGE_UPDATED")]
    EdgeUpdated(EdgeUpdatedEvent),
    #[serde(rename = "CURSOR_MOVED")]
    CursorMoved(CursorMovedEvent),
    #[serde(rename = "NODE_PRESENCE_UPDATED")]
    NodePresenceUpdated(NodePresenceEvent),
}

impl InboundEvent {
    pub const KNOWN_TYPES: [&'static str; 9] = [
        "JOIN_CHAT_FLOW",
        "LEAVE_CHAT_FLOW",
        "USER_COLOR_UPDATED",
        "USER_HEARTBEAT",
        "REQUEST_SNAPSHOT_SYNC",
        "NODE_UPDATED",
        "EDGE_UPDATED",
        "CURSOR_MOVED",
        "NODE_PRESENCE_UPDATED",
    ];

    pub fn is_known_type(event_type: &str) -> bool {
        Self::KNOWN_TYPES.contains(&event_type)
    }

    pub fn header(&self) -> &EventHeader {
        match self {
            InboundEvent::Join(e) => &e.header,
            InboundEvent::Leave(e) => &e.header,
            InboundEvent::ColorUpdated(e) => &e.header,
            InboundEvent::Heartbeat(e) => &e.header,
            InboundEvent::SnapshotRequest(e) => &e.header,
            InboundEvent::NodeUpdated(e) => &e.header,
            InboundEvent::EdgeUpdated(e) => &e.header,
            InboundEvent::CursorMoved(e) => &e.header,
            InboundEvent::NodePresenceUpdated(e) => &e.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut EventHeader {
        match self {
            InboundEvent::Join(e) => &mut e.header,
            InboundEvent::Leave(e) => &mut e.header,
            InboundEvent::ColorUpdated(e) => &mut e.header,
            InboundEvent::Heartbeat(e) => &mut e.header,
            InboundEvent::SnapshotRequest(e) => &mut e.header,
            InboundEvent::NodeUpdated(e) => &mut e.header,
            InboundEvent::EdgeUpdated(e) => &mut e.header,
            InboundEvent::CursorMoved(e) => &mut e.header,
            InboundEvent::NodePresenceUpdated(e) => &mut e.header,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSyncPayload {
    pub document_id: String,
    pub snapshot: FlowData,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChangePayload {
    pub document_id: String,
    pub change_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<FlowNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge: Option<FlowEdge>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CursorMovedPayload {
    pub document_id: String,
    pub x: f64,
    pub y: f64,
    pub name: String,
    pub color: String,
    pub session_id: String,
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdatedPayload {
    pub document_id: String,
    pub users: Vec<PresenceUser>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePresenceUpdatedPayload {
    pub document_id: String,
    pub user_id: String,
    pub session_id: String,
    pub action: NodePresenceAction,
    pub node_id: String,
}

/// Room fan-out messages, serialized as `{type, payload}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum OutboundMessage {
    #[serde(rename = "ON_SNAPSHOT_SYNC")]
    SnapshotSync(SnapshotSyncPayload),
    #[serde(rename = "ON_REMOTE_CHANGE")]
    RemoteChange(RemoteChangePayload),
    #[serde(rename = "ON_CURSOR_MOVED")]
    CursorMoved(CursorMovedPayload),
    #[serde(rename = "ON_PRESENCE_UPDATED")]
    PresenceUpdated(PresenceUpdatedPayload),
    #[serde(rename = "ON_NODE_PRESENCE_UPDATED")]
    NodePresenceUpdated(NodePresenceUpdatedPayload),
}

/// Direct connection-level frames
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ControlFrame {
    #[serde(rename = "auth-error")]
    AuthError { message: String },
    #[serde(rename = "authz-error")]
    AuthzError { message: String },
    #[serde(rename = "validation-error")]
    ValidationError { message: String },
    #[serde(rename = "connection-error")]
    ConnectionError { message: String },
    #[serde(rename = "rate-limit-exceeded", rename_all = "camelCase")]
    RateLimitExceeded { message: String, retry_after: u64 },
    #[serde(rename = "connection-established", rename_all = "camelCase")]
    ConnectionEstablished { session_id: String, user_id: String },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ControlFrame {
    pub fn auth_error() -> Self {
        ControlFrame::AuthError {
            message: "Authentication required. Please log in and try again.".to_string(),
        }
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        ControlFrame::ValidationError { message: message.into() }
    }
}
