use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "attendd.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // The sync worker and the bulk-mark worker open their own connections.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            uid TEXT NOT NULL UNIQUE,
            roll_no TEXT,
            name TEXT NOT NULL,
            division TEXT NOT NULL,
            batch TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_division ON students(division)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS allocations(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('theory', 'practical')),
            division TEXT NOT NULL,
            batch TEXT,
            teacher_id TEXT,
            total_planned INTEGER NOT NULL DEFAULT 0,
            total_conducted INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_allocations_key
         ON allocations(subject_id, kind, division, IFNULL(batch, ''))",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_allocations_teacher ON allocations(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS allocation_students(
            allocation_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(allocation_id, student_id),
            FOREIGN KEY(allocation_id) REFERENCES allocations(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_summaries(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('theory', 'practical')),
            total_conducted INTEGER NOT NULL,
            total_attended REAL NOT NULL,
            percentage REAL NOT NULL,
            period TEXT,
            division TEXT NOT NULL,
            recorded_by TEXT,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    // Summaries written before practical batches were tracked lack the column.
    ensure_attendance_summaries_batch(&conn)?;
    // NULL periods share one slot per (student, subject, kind).
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_summaries_key
         ON attendance_summaries(student_id, subject_id, kind, IFNULL(period, ''))",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_summaries_student
         ON attendance_summaries(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            session_date TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('present', 'absent')),
            marked_by TEXT,
            processing_ms INTEGER,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            audience_kind TEXT NOT NULL,
            audience TEXT NOT NULL,
            event TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_audience
         ON notifications(audience_kind, audience)",
        [],
    )?;

    Ok(conn)
}

fn ensure_attendance_summaries_batch(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "attendance_summaries", "batch")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE attendance_summaries ADD COLUMN batch TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
