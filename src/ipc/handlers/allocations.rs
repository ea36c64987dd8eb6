use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, parse_division, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::layout::SubjectKind;
use crate::sync;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

fn allocations_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let kind_raw = get_required_str(params, "kind")?;
    let Some(kind) = SubjectKind::parse(&kind_raw) else {
        return Err(HandlerErr::bad_params("kind must be theory or practical"));
    };
    let division = parse_division(&get_required_str(params, "division")?)?;
    let batch = match kind {
        SubjectKind::Theory => None,
        SubjectKind::Practical => Some(
            get_optional_str(params, "batch")?
                .map(|b| b.to_ascii_uppercase())
                .ok_or_else(|| HandlerErr::bad_params("practical allocations need a batch"))?,
        ),
    };
    let teacher_id = get_optional_str(params, "teacherId")?;
    let total_planned = match params.get("totalPlanned") {
        None | Some(serde_json::Value::Null) => 0,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| HandlerErr::bad_params("totalPlanned must be a non-negative integer"))?
            as i64,
    };

    let subject_exists = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some();
    if !subject_exists {
        return Err(HandlerErr::new("not_found", "subject not found"));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM allocations
             WHERE subject_id = ? AND kind = ? AND division = ? AND IFNULL(batch, '') = IFNULL(?, '')",
            (&subject_id, kind.as_str(), &division, &batch),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Err(HandlerErr::new("conflict", "allocation already exists")
            .with_details(json!({ "allocationId": id })));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO allocations(
            id, subject_id, kind, division, batch, teacher_id, total_planned, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &subject_id,
            kind.as_str(),
            &division,
            &batch,
            &teacher_id,
            total_planned,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "allocations" }))
    })?;
    Ok(json!({ "allocationId": id }))
}

fn allocations_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let division = match get_optional_str(params, "division")? {
        Some(d) => Some(parse_division(&d)?),
        None => None,
    };
    let teacher_id = get_optional_str(params, "teacherId")?;

    let mut members: HashMap<String, Vec<String>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT m.allocation_id, s.uid
             FROM allocation_students m
             JOIN students s ON s.id = m.student_id
             ORDER BY s.uid",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (allocation_id, uid) in rows {
            members.entry(allocation_id).or_default().push(uid);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT a.id, a.subject_id, sub.code, sub.name, a.kind, a.division, a.batch,
                a.teacher_id, a.total_planned, a.total_conducted, a.updated_at
         FROM allocations a
         JOIN subjects sub ON sub.id = a.subject_id
         WHERE (?1 IS NULL OR a.division = ?1)
           AND (?2 IS NULL OR a.teacher_id = ?2)
         ORDER BY a.division, sub.code, a.kind, a.batch",
    )?;
    let allocations = stmt
        .query_map((&division, &teacher_id), |r| {
            let id: String = r.get(0)?;
            let student_uids = members.get(&id).cloned().unwrap_or_default();
            Ok(json!({
                "id": id,
                "subjectId": r.get::<_, String>(1)?,
                "subjectCode": r.get::<_, String>(2)?,
                "subjectName": r.get::<_, String>(3)?,
                "kind": r.get::<_, String>(4)?,
                "division": r.get::<_, String>(5)?,
                "batch": r.get::<_, Option<String>>(6)?,
                "teacherId": r.get::<_, Option<String>>(7)?,
                "totalPlanned": r.get::<_, i64>(8)?,
                "totalConducted": r.get::<_, i64>(9)?,
                "updatedAt": r.get::<_, Option<String>>(10)?,
                "studentUids": student_uids,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "allocations": allocations }))
}

fn handle_allocations_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match allocations_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_allocations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match allocations_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_allocations_sync(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = match state.sync.as_ref() {
        Some(s) => s.flight().run_inline(|| sync::sync_and_notify(conn)),
        None => Some(sync::sync_and_notify(conn)),
    };
    match result {
        None => ok(&req.id, json!({ "skipped": true })),
        Some(Ok(summary)) => ok(
            &req.id,
            json!({
                "skipped": false,
                "allocations": summary.allocations,
                "changed": summary.changed,
                "memberships": summary.memberships
            }),
        ),
        Some(Err(e)) => err(&req.id, "sync_failed", format!("{:#}", e), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "allocations.create" => Some(handle_allocations_create(state, req)),
        "allocations.list" => Some(handle_allocations_list(state, req)),
        "allocations.sync" => Some(handle_allocations_sync(state, req)),
        _ => None,
    }
}
