use axum::{extract::State, http::StatusCode, Extension, Json};
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

use crate::app::AppState;
use crate::models::{AuthUser, DiagnosticsResponse, ErrorResponse};

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Collaboration and process diagnostics
pub async fn diagnostics(
    State(app): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {
    let rooms = app.rooms.stats();
    let pool = app.pool.stats();
    let presence = app.presence.stats();
    let docs = app.state.stats();

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics for {}: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Rooms: {}, Dirty: {}",
        user.id,
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        pool.active_connections,
        rooms.total_rooms,
        docs.dirty
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            instance_id: rooms.instance_id,
            distributed: rooms.distributed_enabled,
            n_conn: pool.active_connections as u32,
            n_rooms: rooms.total_rooms as u32,
            n_users: pool.unique_users as u32,
            n_presence_sessions: presence.sessions as u32,
            n_snapshots: docs.snapshots as u32,
            n_dirty_docs: docs.dirty as u32,
            n_saving_docs: docs.saving as u32,
            n_messages: pool.total_messages,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
