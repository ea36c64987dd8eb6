use crate::config::EngineConfig;
use crate::db;
use crate::error::{IngestError, IngestErrorKind, RowError};
use crate::grid::{self, Grid};
use crate::layout::{self, LayoutOptions, SheetLayout, SubjectKind};
use crate::resolve::{self, ResolvedSubject};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Removes the uploaded file on drop.
#[derive(Debug)]
pub struct UploadedFile {
    path: PathBuf,
}

impl UploadedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UploadedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("removed upload {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to remove upload {}: {}", self.path.display(), e),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub division: String,
    pub period: Option<String>,
    pub records_created: usize,
    pub records_updated: usize,
    pub subjects_detected: usize,
    pub subjects_matched: usize,
    pub unmatched_subjects: Vec<String>,
    pub duplicate_subjects: Vec<String>,
    pub students_found: usize,
    pub students_not_found: usize,
    pub allocations_updated: usize,
    pub allocations_missing: usize,
    pub errors: Vec<RowError>,
    pub error_count: usize,
}

#[derive(Debug, Clone)]
struct DirectoryStudent {
    id: String,
    batch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationKey {
    pub subject_id: String,
    pub kind: SubjectKind,
    pub division: String,
    pub batch: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AllocationAccumulator {
    /// Only ever set from a total the sheet declares, never from a
    /// per-student fallback.
    pub declared_total: Option<u32>,
    pub student_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryWrite {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
pub struct SummaryRecord<'a> {
    pub student_id: &'a str,
    pub subject_id: &'a str,
    pub kind: SubjectKind,
    pub total_conducted: u32,
    pub total_attended: f64,
    pub percentage: f64,
    pub period: Option<&'a str>,
    pub division: &'a str,
    pub batch: Option<&'a str>,
    pub recorded_by: &'a str,
}

#[derive(Debug, Default)]
struct RowsOutcome {
    created: usize,
    updated: usize,
    students_found: HashSet<String>,
    students_not_found: usize,
    errors: Vec<RowError>,
    allocations: BTreeMap<AllocationKey, AllocationAccumulator>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileOutcome {
    pub updated: usize,
    pub missing: usize,
}

pub fn parse_number(raw: &str) -> Option<f64> {
    let t = raw.trim().trim_end_matches('%').trim();
    if t.is_empty() {
        return None;
    }
    t.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn batch_letter(batch: &str) -> Option<char> {
    batch
        .chars()
        .find(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase())
}

/// Declared total first, then inferred from the percentage, then full
/// attendance. A total below `attended` is bumped to `ceil(attended * 1.2)`.
pub fn derive_total_conducted(attended: f64, provided_pct: Option<f64>, declared: Option<u32>) -> u32 {
    let mut total = match (declared, provided_pct) {
        (Some(t), _) => f64::from(t),
        (None, Some(p)) if p > 0.0 => (attended / p * 100.0).round(),
        _ => attended.round(),
    };
    if total < attended {
        total = attended.round().max((attended * 1.2).ceil());
    }
    total.max(0.0) as u32
}

pub fn derive_percentage(attended: f64, total_conducted: u32, provided_pct: Option<f64>) -> f64 {
    let pct = match provided_pct {
        Some(p) if p > 0.0 => p,
        _ if total_conducted > 0 => attended / f64::from(total_conducted) * 100.0,
        _ => 0.0,
    };
    (pct * 100.0).round() / 100.0
}

/// Inserts or updates the single summary for `(student, subject, kind,
/// period)`. A `None` period matches the existing null-period row.
pub fn upsert_summary(conn: &Connection, rec: &SummaryRecord<'_>) -> rusqlite::Result<SummaryWrite> {
    let now = db::now_rfc3339();
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM attendance_summaries
             WHERE student_id = ? AND subject_id = ? AND kind = ? AND period IS ?",
            (rec.student_id, rec.subject_id, rec.kind.as_str(), rec.period),
            |r| r.get(0),
        )
        .optional()?;

    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE attendance_summaries SET
                   total_conducted = ?, total_attended = ?, percentage = ?,
                   division = ?, batch = ?, recorded_by = ?, updated_at = ?
                 WHERE id = ?",
                (
                    rec.total_conducted,
                    rec.total_attended,
                    rec.percentage,
                    rec.division,
                    rec.batch,
                    rec.recorded_by,
                    &now,
                    &id,
                ),
            )?;
            Ok(SummaryWrite::Updated)
        }
        None => {
            conn.execute(
                "INSERT INTO attendance_summaries(
                   id, student_id, subject_id, kind, total_conducted, total_attended,
                   percentage, period, division, batch, recorded_by, updated_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    rec.student_id,
                    rec.subject_id,
                    rec.kind.as_str(),
                    rec.total_conducted,
                    rec.total_attended,
                    rec.percentage,
                    rec.period,
                    rec.division,
                    rec.batch,
                    rec.recorded_by,
                    &now,
                ),
            )?;
            Ok(SummaryWrite::Created)
        }
    }
}

fn load_division_directory(
    conn: &Connection,
    division: &str,
) -> rusqlite::Result<HashMap<String, DirectoryStudent>> {
    let mut stmt = conn.prepare("SELECT id, uid, batch FROM students WHERE division = ?")?;
    let rows = stmt.query_map([division], |r| {
        let uid: String = r.get(1)?;
        Ok((
            uid.trim().to_uppercase(),
            DirectoryStudent {
                id: r.get(0)?,
                batch: r.get(2)?,
            },
        ))
    })?;
    rows.collect()
}

fn process_rows(
    conn: &Connection,
    grid: &Grid,
    layout: &SheetLayout,
    subjects: &[ResolvedSubject],
    directory: &HashMap<String, DirectoryStudent>,
    division: &str,
    recorded_by: &str,
) -> rusqlite::Result<RowsOutcome> {
    let mut out = RowsOutcome::default();
    let cols = layout.columns;

    for row in (layout.header_row + 1)..grid.len() {
        let uid = grid.cell(row, cols.uid).trim();
        if uid.is_empty() {
            continue;
        }
        let Some(student) = directory.get(&uid.to_uppercase()) else {
            out.students_not_found += 1;
            out.errors.push(RowError::new(
                row,
                Some(uid),
                IngestErrorKind::StudentNotFound,
                format!("no student with UID {} in division {}", uid, division),
            ));
            continue;
        };
        out.students_found.insert(student.id.clone());

        let sheet_batch = cols
            .batch
            .map(|c| grid.cell(row, c).trim().to_uppercase())
            .filter(|b| !b.is_empty());
        let batch = sheet_batch.or_else(|| student.batch.clone());

        for resolved in subjects {
            let sheet = &resolved.sheet;
            let raw = grid.cell(row, sheet.attended_column).trim();
            if raw.is_empty() {
                continue;
            }
            let Some(attended) = parse_number(raw).filter(|v| *v >= 0.0) else {
                out.errors.push(RowError::new(
                    row,
                    Some(uid),
                    IngestErrorKind::InvalidAttendedValue,
                    format!("{} attended value {:?} is not a non-negative number", sheet.code, raw),
                ));
                continue;
            };
            let provided_pct = sheet
                .percentage_column
                .and_then(|c| parse_number(grid.cell(row, c)));

            let (declared, summary_batch) = match sheet.kind {
                SubjectKind::Theory => (sheet.total_lectures, None),
                SubjectKind::Practical => {
                    let declared = batch
                        .as_deref()
                        .and_then(batch_letter)
                        .and_then(|l| sheet.batch_totals.as_ref()?.get(&l).copied());
                    (declared, batch.clone())
                }
            };

            let total_conducted = derive_total_conducted(attended, provided_pct, declared);
            let percentage = derive_percentage(attended, total_conducted, provided_pct);
            let write = upsert_summary(
                conn,
                &SummaryRecord {
                    student_id: &student.id,
                    subject_id: &resolved.subject.id,
                    kind: sheet.kind,
                    total_conducted,
                    total_attended: attended,
                    percentage,
                    period: layout.period.as_deref(),
                    division,
                    batch: summary_batch.as_deref(),
                    recorded_by,
                },
            )?;
            match write {
                SummaryWrite::Created => out.created += 1,
                SummaryWrite::Updated => out.updated += 1,
            }

            let acc = out
                .allocations
                .entry(AllocationKey {
                    subject_id: resolved.subject.id.clone(),
                    kind: sheet.kind,
                    division: division.to_string(),
                    batch: summary_batch,
                })
                .or_default();
            if declared.is_some() {
                acc.declared_total = declared;
            }
            acc.student_ids.insert(student.id.clone());
        }
    }
    Ok(out)
}

fn find_allocation(conn: &Connection, key: &AllocationKey) -> rusqlite::Result<Option<String>> {
    match (key.kind, key.batch.as_deref()) {
        (SubjectKind::Theory, _) => conn
            .query_row(
                "SELECT id FROM allocations
                 WHERE subject_id = ? AND kind = 'theory' AND division = ?
                   AND (batch IS NULL OR batch = '')",
                (&key.subject_id, &key.division),
                |r| r.get(0),
            )
            .optional(),
        (SubjectKind::Practical, Some(batch)) => conn
            .query_row(
                "SELECT id FROM allocations
                 WHERE subject_id = ? AND kind = 'practical' AND division = ?
                   AND UPPER(batch) = UPPER(?)",
                (&key.subject_id, &key.division, batch),
                |r| r.get(0),
            )
            .optional(),
        (SubjectKind::Practical, None) => Ok(None),
    }
}

fn reconcile_one(
    conn: &Connection,
    allocation_id: &str,
    acc: &AllocationAccumulator,
) -> rusqlite::Result<()> {
    if let Some(total) = acc.declared_total {
        conn.execute(
            "UPDATE allocations SET total_planned = ?, total_conducted = ?, updated_at = ?
             WHERE id = ?",
            (total, total, db::now_rfc3339(), allocation_id),
        )?;
    }
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO allocation_students(allocation_id, student_id) VALUES(?, ?)",
    )?;
    for sid in &acc.student_ids {
        stmt.execute((allocation_id, sid))?;
    }
    Ok(())
}

pub fn reconcile_allocations(
    conn: &Connection,
    accumulated: &BTreeMap<AllocationKey, AllocationAccumulator>,
) -> ReconcileOutcome {
    let mut out = ReconcileOutcome::default();
    for (key, acc) in accumulated {
        let allocation_id = match find_allocation(conn, key) {
            Ok(Some(id)) => id,
            Ok(None) => {
                log::warn!(
                    "no allocation for subject {} {} division {} batch {}",
                    key.subject_id,
                    key.kind.as_str(),
                    key.division,
                    key.batch.as_deref().unwrap_or("-")
                );
                out.missing += 1;
                continue;
            }
            Err(e) => {
                log::warn!("allocation lookup failed for {:?}: {}", key, e);
                continue;
            }
        };
        match reconcile_one(conn, &allocation_id, acc) {
            Ok(()) => out.updated += 1,
            Err(e) => log::warn!("failed to reconcile allocation {}: {}", allocation_id, e),
        }
    }
    out
}

pub fn upload_division_sheet(
    conn: &Connection,
    file: UploadedFile,
    division: &str,
    recorded_by: &str,
    cfg: &EngineConfig,
) -> Result<UploadOutcome, IngestError> {
    log::info!(
        "ingesting {} for division {} (by {})",
        file.path().display(),
        division,
        recorded_by
    );
    let grid = grid::normalize_file(file.path())?;
    let layout = layout::infer_layout(
        &grid,
        LayoutOptions {
            scan_rows: cfg.header_scan_rows,
            window_radius: cfg.window_radius,
        },
    )?;
    log::debug!(
        "layout: header row {}, subject row {:?}, category row {:?}, theory from col {}, lab from col {:?}, roll/uid/name cols {}/{}/{}",
        layout.header_row + 1,
        layout.subject_row.map(|r| r + 1),
        layout.category_row.map(|r| r + 1),
        layout.theory_start + 1,
        layout.lab_start.map(|c| c + 1),
        layout.columns.roll + 1,
        layout.columns.uid + 1,
        layout.columns.name + 1
    );
    let catalog = resolve::load_catalog(conn)?;
    let resolution = resolve::resolve_subjects(&layout.subjects, &catalog)?;

    let directory = load_division_directory(conn, division)?;
    if directory.is_empty() {
        return Err(IngestError::new(
            IngestErrorKind::NoStudentsInDivision,
            format!("division {} has no students", division),
        ));
    }

    let tx = conn.unchecked_transaction()?;
    let rows = process_rows(
        &tx,
        &grid,
        &layout,
        &resolution.matched,
        &directory,
        division,
        recorded_by,
    )?;
    let reconciled = reconcile_allocations(&tx, &rows.allocations);
    tx.commit()?;

    let error_count = rows.errors.len();
    let mut errors = rows.errors;
    errors.truncate(cfg.max_reported_errors);

    let outcome = UploadOutcome {
        division: division.to_string(),
        period: layout.period.clone(),
        records_created: rows.created,
        records_updated: rows.updated,
        subjects_detected: layout.subjects.len(),
        subjects_matched: resolution.matched.len(),
        unmatched_subjects: resolution.unmatched.iter().map(|s| s.code.clone()).collect(),
        duplicate_subjects: resolution.duplicates.iter().map(|s| s.code.clone()).collect(),
        students_found: rows.students_found.len(),
        students_not_found: rows.students_not_found,
        allocations_updated: reconciled.updated,
        allocations_missing: reconciled.missing,
        errors,
        error_count,
    };
    log::info!(
        "division {} upload done: {} created, {} updated, {} row errors, {} allocations updated",
        division,
        outcome.records_created,
        outcome.records_updated,
        outcome.error_count,
        outcome.allocations_updated
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn seed(conn: &Connection) {
        conn.execute(
            "INSERT INTO students(id, uid, name, division, batch) VALUES('st1', 'U1', 'Asha', 'A', 'A1')",
            [],
        )
        .expect("student");
        conn.execute(
            "INSERT INTO subjects(id, name, code) VALUES('sub1', 'Software Engineering', 'SE')",
            [],
        )
        .expect("subject");
    }

    fn record<'a>(period: Option<&'a str>, attended: f64) -> SummaryRecord<'a> {
        SummaryRecord {
            student_id: "st1",
            subject_id: "sub1",
            kind: SubjectKind::Theory,
            total_conducted: 32,
            total_attended: attended,
            percentage: attended / 32.0 * 100.0,
            period,
            division: "A",
            batch: None,
            recorded_by: "t1",
        }
    }

    #[test]
    fn safety_floor_never_reports_fewer_lectures_than_attended() {
        assert_eq!(derive_total_conducted(30.0, None, None), 30);
        assert_eq!(derive_total_conducted(28.0, Some(87.5), None), 32);
        assert_eq!(derive_total_conducted(28.0, Some(87.5), Some(40)), 40);
        // Declared total below attended: bumped to max(round, ceil(1.2x)).
        assert_eq!(derive_total_conducted(30.0, None, Some(20)), 36);
        assert_eq!(derive_total_conducted(0.0, None, None), 0);
    }

    #[test]
    fn percentage_prefers_provided_value() {
        assert_eq!(derive_percentage(28.0, 32, None), 87.5);
        assert_eq!(derive_percentage(28.0, 32, Some(90.0)), 90.0);
        assert_eq!(derive_percentage(0.0, 0, None), 0.0);
        assert_eq!(derive_percentage(2.0, 3, Some(0.0)), 66.67);
    }

    #[test]
    fn batch_letter_ignores_digits_and_case() {
        assert_eq!(batch_letter("b2"), Some('B'));
        assert_eq!(batch_letter("12"), None);
    }

    #[test]
    fn null_period_upserts_share_one_row() {
        let dir = temp_dir("attendd-ingest-null-period");
        let conn = db::open_db(&dir).expect("open db");
        seed(&conn);

        assert_eq!(upsert_summary(&conn, &record(None, 20.0)).expect("first"), SummaryWrite::Created);
        assert_eq!(upsert_summary(&conn, &record(None, 25.0)).expect("second"), SummaryWrite::Updated);
        assert_eq!(
            upsert_summary(&conn, &record(Some("Aug-25 to Oct-25"), 25.0)).expect("dated"),
            SummaryWrite::Created
        );

        let (rows, attended): (i64, f64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(total_attended) FROM attendance_summaries WHERE period IS NULL",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("count");
        assert_eq!(rows, 1);
        assert_eq!(attended, 25.0);
        drop(conn);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn reconcile_leaves_totals_alone_without_declared_total() {
        let dir = temp_dir("attendd-ingest-reconcile");
        let conn = db::open_db(&dir).expect("open db");
        seed(&conn);
        conn.execute(
            "INSERT INTO allocations(id, subject_id, kind, division, total_planned, total_conducted)
             VALUES('al1', 'sub1', 'theory', 'A', 40, 38)",
            [],
        )
        .expect("allocation");

        let key = AllocationKey {
            subject_id: "sub1".to_string(),
            kind: SubjectKind::Theory,
            division: "A".to_string(),
            batch: None,
        };
        let mut acc = BTreeMap::new();
        acc.insert(
            key.clone(),
            AllocationAccumulator {
                declared_total: None,
                student_ids: ["st1".to_string()].into_iter().collect(),
            },
        );
        let out = reconcile_allocations(&conn, &acc);
        assert_eq!(out.updated, 1);

        let (planned, conducted, members): (i64, i64, i64) = conn
            .query_row(
                "SELECT total_planned, total_conducted,
                   (SELECT COUNT(*) FROM allocation_students WHERE allocation_id = 'al1')
                 FROM allocations WHERE id = 'al1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .expect("allocation row");
        assert_eq!((planned, conducted, members), (40, 38, 1));

        // A missing practical allocation is counted, not fatal.
        acc.clear();
        acc.insert(
            AllocationKey {
                kind: SubjectKind::Practical,
                batch: Some("A1".to_string()),
                ..key
            },
            AllocationAccumulator {
                declared_total: Some(10),
                student_ids: BTreeSet::new(),
            },
        );
        let out = reconcile_allocations(&conn, &acc);
        assert_eq!((out.updated, out.missing), (0, 1));
        drop(conn);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn uploaded_file_is_removed_on_drop() {
        let dir = temp_dir("attendd-ingest-guard");
        let path = dir.join("sheet.pdf");
        std::fs::write(&path, b"not a sheet").expect("write upload");
        let conn = db::open_db(&dir).expect("open db");

        let e = upload_division_sheet(
            &conn,
            UploadedFile::new(&path),
            "A",
            "t1",
            &EngineConfig::default(),
        )
        .expect_err("unsupported");
        assert_eq!(e.kind, IngestErrorKind::UnsupportedFormat);
        assert!(!path.exists());
        drop(conn);
        let _ = std::fs::remove_dir_all(dir);
    }
}
