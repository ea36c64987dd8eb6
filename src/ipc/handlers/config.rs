use crate::config::EngineConfig;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::core::restart_sync;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match EngineConfig::load(conn) {
        Ok(cfg) => ok(&req.id, json!(cfg)),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_config_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut cfg = match EngineConfig::load(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let previous_interval = cfg.sync_interval_secs;
    if let Err(msg) = cfg.apply_patch(patch) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = cfg.save(conn) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if cfg.sync_interval_secs != previous_interval {
        restart_sync(state, cfg.sync_interval_secs);
    }
    ok(&req.id, json!(cfg))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "config.get" => Some(handle_config_get(state, req)),
        "config.update" => Some(handle_config_update(state, req)),
        _ => None,
    }
}
