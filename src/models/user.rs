use serde::{Deserialize, Serialize};

/// Identity attached to an authenticated connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub active_workspace_id: Option<String>,
    #[serde(default)]
    pub workspace_ids: Vec<String>,
}

impl AuthUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            email: None,
            active_workspace_id: None,
            workspace_ids: Vec::new(),
        }
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        let workspace_id = workspace_id.into();
        if !self.workspace_ids.contains(&workspace_id) {
            self.workspace_ids.push(workspace_id.clone());
        }
        self.active_workspace_id = Some(workspace_id);
        self
    }

    /// True when the user's active or assigned workspaces include `scope_id`
    pub fn in_scope(&self, scope_id: &str) -> bool {
        self.active_workspace_id.as_deref() == Some(scope_id)
            || self.workspace_ids.iter().any(|w| w == scope_id)
    }
}
