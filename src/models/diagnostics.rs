use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for diagnostics information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct DiagnosticsResponse {
    pub instance_id: String,
    pub distributed: bool,
    pub n_conn: u32,
    pub n_rooms: u32,
    pub n_users: u32,
    pub n_presence_sessions: u32,
    pub n_snapshots: u32,
    pub n_dirty_docs: u32,
    pub n_saving_docs: u32,
    pub n_messages: u64,
    pub cpu_usage: f32,
    pub memory_alloc: u64,
    pub memory_total: u64,
    pub memory_free: u64,
}
