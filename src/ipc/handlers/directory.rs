use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, parse_division, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let uid = get_required_str(params, "uid")?;
    let name = get_required_str(params, "name")?;
    let division = parse_division(&get_required_str(params, "division")?)?;
    let roll_no = get_optional_str(params, "rollNo")?;
    let batch = get_optional_str(params, "batch")?.map(|b| b.to_ascii_uppercase());

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE UPPER(uid) = UPPER(?)",
            [&uid],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Err(HandlerErr::new("conflict", format!("uid {} already exists", uid))
            .with_details(json!({ "studentId": id })));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, uid, roll_no, name, division, batch, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, &uid, &roll_no, &name, &division, &batch, db::now_rfc3339()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "students" }))
    })?;
    Ok(json!({ "studentId": id }))
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let division = match get_optional_str(params, "division")? {
        Some(d) => Some(parse_division(&d)?),
        None => None,
    };
    let mut stmt = conn.prepare(
        "SELECT id, uid, roll_no, name, division, batch
         FROM students
         WHERE (?1 IS NULL OR division = ?1)
         ORDER BY division, roll_no, name",
    )?;
    let students = stmt
        .query_map([&division], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "uid": r.get::<_, String>(1)?,
                "rollNo": r.get::<_, Option<String>>(2)?,
                "name": r.get::<_, String>(3)?,
                "division": r.get::<_, String>(4)?,
                "batch": r.get::<_, Option<String>>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn subjects_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let code = get_required_str(params, "code")?;
    let taken: bool = conn
        .query_row(
            "SELECT 1 FROM subjects WHERE LOWER(code) = LOWER(?)",
            [&code],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if taken {
        return Err(HandlerErr::new(
            "conflict",
            format!("subject code {} already exists", code),
        ));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, code) VALUES(?, ?, ?)",
        (&id, &name, &code),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "subjects" }))
    })?;
    Ok(json!({ "subjectId": id }))
}

fn subjects_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let subjects = crate::resolve::load_catalog(conn)?;
    Ok(json!({ "subjects": subjects }))
}

fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(with_db(state, req, students_create)),
        "students.list" => Some(with_db(state, req, students_list)),
        "subjects.create" => Some(with_db(state, req, subjects_create)),
        "subjects.list" => Some(with_db(state, req, |conn, _| subjects_list(conn))),
        _ => None,
    }
}
