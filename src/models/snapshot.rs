use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::StoreError;
use crate::models::{AuthUser, FlowData, FlowEdge, FlowNode, Viewport};

/// A document as held by the persistent store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredDocument {
    pub id: String,
    /// Workspace the document belongs to
    pub scope_id: String,
    /// Serialized graph, a JSON object with at least `nodes`, `edges`, `viewport`
    pub flow_data: String,
}

impl StoredDocument {
    pub fn parse_flow_data(&self) -> Result<FlowData, StoreError> {
        if self.flow_data.trim().is_empty() {
            return Ok(FlowData::default());
        }
        serde_json::from_str(&self.flow_data).map_err(|e| StoreError::Malformed {
            document_id: self.id.clone(),
            message: e.to_string(),
        })
    }

    /// Replace `nodes`, `edges` and `viewport` in the stored graph, keeping any other keys.
    pub fn merge_flow_data(&self, data: &FlowData) -> Result<StoredDocument, StoreError> {
        let malformed = |e: serde_json::Error| StoreError::Malformed {
            document_id: self.id.clone(),
            message: e.to_string(),
        };

        let mut root = match serde_json::from_str::<Value>(&self.flow_data) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        root.insert("nodes".to_string(), serde_json::to_value(&data.nodes).map_err(malformed)?);
        root.insert("edges".to_string(), serde_json::to_value(&data.edges).map_err(malformed)?);
        root.insert("viewport".to_string(), serde_json::to_value(data.viewport).map_err(malformed)?);

        Ok(StoredDocument {
            id: self.id.clone(),
            scope_id: self.scope_id.clone(),
            flow_data: serde_json::to_string(&Value::Object(root)).map_err(malformed)?,
        })
    }
}

/// Authoritative in-memory state of one collaboratively edited document.
///
/// Every id in `nodes`/`edges` has an entry in the matching timestamp map.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub document_id: String,
    pub scope_id: String,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
    pub viewport: Viewport,
    pub updated_at: DateTime<Utc>,
    pub last_editor: Option<AuthUser>,
    pub node_timestamps: HashMap<String, i64>,
    pub edge_timestamps: HashMap<String, i64>,
}

impl DocumentSnapshot {
    pub fn empty(document_id: impl Into<String>, scope_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            scope_id: scope_id.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            viewport: Viewport::default(),
            updated_at: Utc::now(),
            last_editor: None,
            node_timestamps: HashMap::new(),
            edge_timestamps: HashMap::new(),
        }
    }

    /// Decompose a stored document. Every existing node and edge is stamped with `loaded_at_ms`.
    pub fn from_stored(doc: &StoredDocument, loaded_at_ms: i64) -> Result<Self, StoreError> {
        let data = doc.parse_flow_data()?;
        let node_timestamps = data.nodes.iter().map(|n| (n.id.clone(), loaded_at_ms)).collect();
        let edge_timestamps = data.edges.iter().map(|e| (e.id.clone(), loaded_at_ms)).collect();

        Ok(Self {
            document_id: doc.id.clone(),
            scope_id: doc.scope_id.clone(),
            nodes: data.nodes,
            edges: data.edges,
            viewport: data.viewport,
            updated_at: Utc::now(),
            last_editor: None,
            node_timestamps,
            edge_timestamps,
        })
    }

    /// Client-facing view: no timestamps, no editor attribution
    pub fn flow_data(&self) -> FlowData {
        FlowData {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
            viewport: self.viewport,
        }
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&FlowEdge> {
        self.edges.iter().find(|e| e.id == id)
    }
}
