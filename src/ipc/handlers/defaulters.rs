use crate::config::EngineConfig;
use crate::defaulters::{self, DefaulterQuery, SubjectScope};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, parse_division, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn caller_scope(conn: &Connection, params: &serde_json::Value) -> Result<SubjectScope, HandlerErr> {
    let role = get_optional_str(params, "role")?.map(|r| r.to_ascii_lowercase());
    if role.as_deref() != Some("teacher") {
        return Ok(SubjectScope::All);
    }
    let Some(teacher_id) = get_optional_str(params, "teacherId")? else {
        return Err(HandlerErr::bad_params("teacherId is required for role teacher"));
    };
    Ok(defaulters::teacher_scope(conn, &teacher_id)?)
}

fn optional_division(params: &serde_json::Value) -> Result<Option<String>, HandlerErr> {
    match get_optional_str(params, "division")? {
        Some(d) => Ok(Some(parse_division(&d)?)),
        None => Ok(None),
    }
}

fn defaulters_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let threshold = match params.get("threshold") {
        None | Some(serde_json::Value::Null) => EngineConfig::load(conn)?.defaulter_threshold,
        Some(v) => {
            let t = v
                .as_f64()
                .ok_or_else(|| HandlerErr::bad_params("threshold must be a number"))?;
            if !(0.0..=100.0).contains(&t) {
                return Err(HandlerErr::bad_params("threshold must be between 0 and 100"));
            }
            t
        }
    };
    let query = DefaulterQuery {
        threshold,
        scope: caller_scope(conn, params)?,
        division: optional_division(params)?,
    };
    let students = defaulters::list_defaulters(conn, &query)?;
    Ok(json!({
        "threshold": threshold,
        "count": students.len(),
        "students": students
    }))
}

fn defaulters_bands(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let scope = caller_scope(conn, params)?;
    let division = optional_division(params)?;
    let report = defaulters::band_students(conn, &scope, division.as_deref())?;
    Ok(json!(report))
}

fn handle_defaulters_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match defaulters_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_defaulters_bands(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match defaulters_bands(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "defaulters.list" => Some(handle_defaulters_list(state, req)),
        "defaulters.bands" => Some(handle_defaulters_bands(state, req)),
        _ => None,
    }
}
