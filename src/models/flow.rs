use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// Helper function to deserialize null as default value
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// A node on the canvas. Only `id` and `selected` are interpreted by the server,
/// every other field is carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FlowNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            selected: None,
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn is_selected(&self) -> bool {
        self.selected.unwrap_or(false)
    }
}

/// An edge between two nodes, carried through untouched apart from `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowEdge {
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FlowEdge {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Viewport {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "default_zoom")]
    pub zoom: f64,
}

fn default_zoom() -> f64 {
    1.0
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            zoom: default_zoom(),
        }
    }
}

/// The graph part of a stored document (`flowData`)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowData {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub nodes: Vec<FlowNode>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub edges: Vec<FlowEdge>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub viewport: Viewport,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_keeps_unknown_fields() {
        let raw = json!({
            "id": "llmChain_0",
            "position": {"x": 10, "y": 20},
            "data": {"label": "LLM Chain"},
            "selected": false
        });
        let node: FlowNode = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(node.id, "llmChain_0");
        assert_eq!(node.selected, Some(false));
        assert_eq!(node.extra["position"]["x"], 10);
        assert_eq!(serde_json::to_value(&node).unwrap(), raw);
    }

    #[test]
    fn flow_data_tolerates_missing_and_null_parts() {
        let data: FlowData = serde_json::from_str(r#"{"nodes": null}"#).unwrap();
        assert!(data.nodes.is_empty());
        assert!(data.edges.is_empty());
        assert_eq!(data.viewport, Viewport::default());
    }
}
