use crate::config::EngineConfig;
use crate::defaulters;
use crate::ingest::{self, UploadedFile};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, parse_division, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::layout::SubjectKind;
use crate::marking::{self, MarkRecord, MarkStatus};
use crate::notify::{self, Audience, OutboxNotifier};
use rusqlite::Connection;
use serde_json::json;
use std::path::Path;

fn handle_upload_division_sheet(state: &mut AppState, req: &Request) -> serde_json::Value {
    // Take ownership of the file first so it is removed on every exit below.
    let file = match get_required_str(&req.params, "path") {
        Ok(p) => UploadedFile::new(p),
        Err(e) => return e.response(&req.id),
    };
    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let division = match get_required_str(&req.params, "division").and_then(|d| parse_division(&d))
    {
        Ok(d) => d,
        Err(e) => return e.response(&req.id),
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(t) => t,
        Err(e) => return e.response(&req.id),
    };
    let cfg = match EngineConfig::load(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let outcome = match ingest::upload_division_sheet(conn, file, &division, &teacher_id, &cfg) {
        Ok(o) => o,
        Err(e) => {
            log::warn!("division {} upload failed ({:?}): {}", division, e.kind, e);
            return HandlerErr::from(e).response(&req.id);
        }
    };

    notify::publish_all(
        &OutboxNotifier::new(conn),
        &[
            Audience::Role("admin".to_string()),
            Audience::User(teacher_id.clone()),
        ],
        notify::EVENT_UPLOADED,
        &json!({
            "division": outcome.division,
            "period": outcome.period,
            "teacherId": teacher_id,
            "recordsCreated": outcome.records_created,
            "recordsUpdated": outcome.records_updated,
            "errorCount": outcome.error_count,
        }),
    );
    defaulters::spawn_post_upload_check(
        workspace.clone(),
        teacher_id,
        division,
        cfg.defaulter_threshold,
    );
    ok(&req.id, json!(outcome))
}

fn summaries_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId")?;
    let subject_id = get_optional_str(params, "subjectId")?;
    let division = match get_optional_str(params, "division")? {
        Some(d) => Some(parse_division(&d)?),
        None => None,
    };
    let mut stmt = conn.prepare(
        "SELECT a.id, a.student_id, s.uid, s.name, a.subject_id, sub.code, a.kind,
                a.total_conducted, a.total_attended, a.percentage, a.period,
                a.division, a.batch, a.recorded_by, a.updated_at
         FROM attendance_summaries a
         JOIN students s ON s.id = a.student_id
         JOIN subjects sub ON sub.id = a.subject_id
         WHERE (?1 IS NULL OR a.student_id = ?1)
           AND (?2 IS NULL OR a.subject_id = ?2)
           AND (?3 IS NULL OR a.division = ?3)
         ORDER BY a.division, s.uid, sub.code, a.kind, a.period",
    )?;
    let summaries = stmt
        .query_map((&student_id, &subject_id, &division), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "uid": r.get::<_, String>(2)?,
                "studentName": r.get::<_, String>(3)?,
                "subjectId": r.get::<_, String>(4)?,
                "subjectCode": r.get::<_, String>(5)?,
                "kind": r.get::<_, String>(6)?,
                "totalConducted": r.get::<_, i64>(7)?,
                "totalAttended": r.get::<_, f64>(8)?,
                "percentage": r.get::<_, f64>(9)?,
                "period": r.get::<_, Option<String>>(10)?,
                "division": r.get::<_, String>(11)?,
                "batch": r.get::<_, Option<String>>(12)?,
                "recordedBy": r.get::<_, Option<String>>(13)?,
                "updatedAt": r.get::<_, String>(14)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "summaries": summaries }))
}

fn parse_mark_records(params: &serde_json::Value) -> Result<Vec<MarkRecord>, HandlerErr> {
    let Some(items) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("records must be an array"));
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let field = |key: &str| {
            get_required_str(item, key).map_err(|e| e.with_details(json!({ "index": i })))
        };
        let kind_raw = field("kind")?;
        let Some(kind) = SubjectKind::parse(&kind_raw) else {
            return Err(HandlerErr::bad_params("kind must be theory or practical")
                .with_details(json!({ "index": i })));
        };
        let status_raw = field("status")?;
        let Some(status) = MarkStatus::parse(&status_raw) else {
            return Err(HandlerErr::bad_params("status must be present or absent")
                .with_details(json!({ "index": i })));
        };
        let session_date = field("date")?;
        if chrono::NaiveDate::parse_from_str(&session_date, "%Y-%m-%d").is_err() {
            return Err(HandlerErr::bad_params("date must be YYYY-MM-DD")
                .with_details(json!({ "index": i })));
        }
        out.push(MarkRecord {
            student_id: field("studentId")?,
            subject_id: field("subjectId")?,
            kind,
            session_date,
            status,
        });
    }
    Ok(out)
}

fn bulk_mark(
    conn: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let marked_by = get_required_str(params, "markedBy")?;
    let records = parse_mark_records(params)?;
    let cfg = EngineConfig::load(conn)?;

    if records.len() > cfg.bulk_offload_threshold {
        let count = records.len();
        marking::spawn_bulk_insert(workspace.to_path_buf(), records, marked_by);
        return Ok(json!({ "queued": true, "count": count }));
    }
    let outcome = marking::insert_marks(conn, &records, &marked_by).map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "attendance_records" }))
    })?;
    Ok(json!({
        "queued": false,
        "inserted": outcome.inserted,
        "processingMs": outcome.processing_ms
    }))
}

fn handle_summaries_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match summaries_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_bulk_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match bulk_mark(conn, workspace, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.uploadDivisionSheet" => Some(handle_upload_division_sheet(state, req)),
        "attendance.summaries.list" => Some(handle_summaries_list(state, req)),
        "attendance.bulkMark" => Some(handle_bulk_mark(state, req)),
        _ => None,
    }
}
