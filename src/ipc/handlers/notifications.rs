use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn notifications_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let (kind, id) = match get_optional_str(params, "audience")? {
        None => (None, None),
        Some(a) => {
            let Some((kind, id)) = a.split_once(':') else {
                return Err(HandlerErr::bad_params("audience must be role:<name> or user:<id>"));
            };
            let kind = kind.trim().to_ascii_lowercase();
            if kind != "role" && kind != "user" {
                return Err(HandlerErr::bad_params("audience must be role:<name> or user:<id>"));
            }
            (Some(kind), Some(id.trim().to_string()))
        }
    };
    let event = get_optional_str(params, "event")?;

    let mut stmt = conn.prepare(
        "SELECT id, audience_kind, audience, event, payload_json, created_at
         FROM notifications
         WHERE (?1 IS NULL OR audience_kind = ?1)
           AND (?2 IS NULL OR audience = ?2)
           AND (?3 IS NULL OR event = ?3)
         ORDER BY created_at DESC, rowid DESC",
    )?;
    let rows = stmt
        .query_map((&kind, &id, &event), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let notifications: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, audience_kind, audience, event, payload_json, created_at)| {
            let payload = serde_json::from_str::<serde_json::Value>(&payload_json)
                .unwrap_or(serde_json::Value::Null);
            json!({
                "id": id,
                "audience": { "kind": audience_kind, "id": audience },
                "event": event,
                "payload": payload,
                "createdAt": created_at
            })
        })
        .collect();
    Ok(json!({ "notifications": notifications }))
}

fn handle_notifications_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match notifications_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.list" => Some(handle_notifications_list(state, req)),
        _ => None,
    }
}
