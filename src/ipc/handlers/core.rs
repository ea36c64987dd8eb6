use crate::config::EngineConfig;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::sync::{AllocationSyncScheduler, SyncState};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    let sync_state = state.sync.as_ref().map(|s| match s.flight().state() {
        SyncState::Idle => "idle",
        SyncState::Running => "running",
    });
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "syncState": sync_state
        }),
    )
}

pub fn restart_sync(state: &mut AppState, interval_secs: u64) {
    // Dropping the old scheduler stops its ticker.
    state.sync = None;
    let Some(workspace) = state.workspace.clone() else {
        return;
    };
    match AllocationSyncScheduler::start(workspace, Duration::from_secs(interval_secs)) {
        Ok(s) => state.sync = Some(s),
        Err(e) => log::warn!("allocation sync not started: {:#}", e),
    }
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            let cfg = EngineConfig::load(&conn).unwrap_or_else(|e| {
                log::warn!("engine config unreadable, using defaults: {:#}", e);
                EngineConfig::default()
            });
            log::info!("workspace selected: {}", path.display());
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            restart_sync(state, cfg.sync_interval_secs);
            ok(
                &req.id,
                json!({
                    "workspacePath": path.to_string_lossy(),
                    "syncIntervalSecs": cfg.sync_interval_secs
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
