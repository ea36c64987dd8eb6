use crate::db;
use crate::layout::SubjectKind;
use crate::notify::{self, Audience, OutboxNotifier};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkStatus {
    Present,
    Absent,
}

impl MarkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" | "p" => Some(Self::Present),
            "absent" | "a" => Some(Self::Absent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkRecord {
    pub student_id: String,
    pub subject_id: String,
    pub kind: SubjectKind,
    pub session_date: String,
    pub status: MarkStatus,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkOutcome {
    pub inserted: usize,
    pub processing_ms: u64,
}

/// Inserts one batch in a single transaction. Every row of the batch carries
/// the same `processing_ms`: the time taken for the whole batch.
pub fn insert_marks(
    conn: &Connection,
    records: &[MarkRecord],
    marked_by: &str,
) -> rusqlite::Result<MarkOutcome> {
    let started = Instant::now();
    let tx = conn.unchecked_transaction()?;
    let now = db::now_rfc3339();
    let mut ids = Vec::with_capacity(records.len());
    {
        let mut stmt = tx.prepare(
            "INSERT INTO attendance_records(
                id, student_id, subject_id, kind, session_date, status, marked_by, created_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for r in records {
            let id = Uuid::new_v4().to_string();
            stmt.execute((
                &id,
                &r.student_id,
                &r.subject_id,
                r.kind.as_str(),
                &r.session_date,
                r.status.as_str(),
                marked_by,
                &now,
            ))?;
            ids.push(id);
        }
    }
    let processing_ms = started.elapsed().as_millis() as u64;
    {
        let mut stmt = tx.prepare("UPDATE attendance_records SET processing_ms = ? WHERE id = ?")?;
        for id in &ids {
            stmt.execute((processing_ms as i64, id))?;
        }
    }
    tx.commit()?;
    Ok(MarkOutcome {
        inserted: ids.len(),
        processing_ms,
    })
}

pub fn spawn_bulk_insert(workspace: PathBuf, records: Vec<MarkRecord>, marked_by: String) {
    let spawned = std::thread::Builder::new()
        .name("bulk-mark".to_string())
        .spawn(move || {
            let result = db::open_db(&workspace)
                .and_then(|conn| Ok((insert_marks(&conn, &records, &marked_by)?, conn)));
            match result {
                Ok((outcome, conn)) => {
                    log::info!(
                        "bulk mark by {}: {} records in {}ms",
                        marked_by,
                        outcome.inserted,
                        outcome.processing_ms
                    );
                    notify::publish_all(
                        &OutboxNotifier::new(&conn),
                        &[Audience::User(marked_by.clone())],
                        notify::EVENT_BULK_MARKED,
                        &json!(outcome),
                    );
                }
                Err(e) => log::warn!("bulk mark by {} failed: {:#}", marked_by, e),
            }
        });
    if let Err(e) = spawned {
        log::warn!("could not start bulk mark worker: {}", e);
    }
}
