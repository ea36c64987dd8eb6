use crate::db;
use crate::notify::{self, Audience, OutboxNotifier};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DefaulterBand {
    #[serde(rename = "below50")]
    Below50,
    #[serde(rename = "between50and65")]
    Between50And65,
    #[serde(rename = "between65and75")]
    Between65And75,
}

/// `< 50`, `[50, 65]`, `(65, 75)`; anything else is not banded.
pub fn classify_band(percentage: f64) -> Option<DefaulterBand> {
    if percentage < 50.0 {
        Some(DefaulterBand::Below50)
    } else if percentage <= 65.0 {
        Some(DefaulterBand::Between50And65)
    } else if percentage < 75.0 {
        Some(DefaulterBand::Between65And75)
    } else {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub enum SubjectScope {
    #[default]
    All,
    Only(HashSet<String>),
}

impl SubjectScope {
    fn allows(&self, subject_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(ids) => ids.contains(subject_id),
        }
    }
}

pub fn teacher_scope(conn: &Connection, teacher_id: &str) -> rusqlite::Result<SubjectScope> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT subject_id FROM allocations WHERE teacher_id = ?")?;
    let ids = stmt
        .query_map([teacher_id], |r| r.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(SubjectScope::Only(ids))
}

#[derive(Debug, Clone)]
pub struct DefaulterQuery {
    pub threshold: f64,
    pub scope: SubjectScope,
    pub division: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaulterSubject {
    pub subject_id: String,
    pub code: String,
    pub name: String,
    pub kind: String,
    pub total_conducted: i64,
    pub total_attended: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentDefaulters {
    pub student_id: String,
    pub uid: String,
    pub name: String,
    pub division: String,
    pub batch: Option<String>,
    pub subjects: Vec<DefaulterSubject>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandedStudent {
    pub student_id: String,
    pub uid: String,
    pub name: String,
    pub division: String,
    pub percentage: f64,
    pub band: DefaulterBand,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BandReport {
    #[serde(rename = "below50")]
    pub below50: Vec<BandedStudent>,
    #[serde(rename = "between50and65")]
    pub between50and65: Vec<BandedStudent>,
    #[serde(rename = "between65and75")]
    pub between65and75: Vec<BandedStudent>,
}

#[derive(Debug, Clone)]
struct StudentInfo {
    uid: String,
    name: String,
    division: String,
    batch: Option<String>,
}

#[derive(Debug, Clone)]
struct SubjectInfo {
    code: String,
    name: String,
}

#[derive(Debug, Clone, Default)]
struct Tally {
    conducted: i64,
    attended: f64,
    stored_pct_sum: f64,
    stored_pct_weight: f64,
}

impl Tally {
    fn add(&mut self, conducted: i64, attended: f64, stored_pct: f64) {
        self.conducted += conducted;
        self.attended += attended;
        if stored_pct > 0.0 {
            let w = conducted.max(1) as f64;
            self.stored_pct_sum += stored_pct * w;
            self.stored_pct_weight += w;
        }
    }

    fn percentage(&self) -> Option<f64> {
        if self.stored_pct_weight > 0.0 {
            return Some(self.stored_pct_sum / self.stored_pct_weight);
        }
        if self.conducted > 0 {
            return Some(self.attended / self.conducted as f64 * 100.0);
        }
        None
    }
}

struct SummaryRow {
    student_id: String,
    student: StudentInfo,
    subject_id: String,
    subject: SubjectInfo,
    kind: String,
    conducted: i64,
    attended: f64,
    percentage: f64,
}

fn load_rows(conn: &Connection, division: Option<&str>) -> rusqlite::Result<Vec<SummaryRow>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.uid, s.name, s.division, s.batch,
                a.subject_id, sub.code, sub.name, a.kind,
                a.total_conducted, a.total_attended, a.percentage
         FROM attendance_summaries a
         JOIN students s ON s.id = a.student_id
         JOIN subjects sub ON sub.id = a.subject_id
         WHERE (?1 IS NULL OR s.division = ?1)
         ORDER BY s.division, s.uid, sub.code, a.kind",
    )?;
    let rows = stmt.query_map([division], |r| {
        Ok(SummaryRow {
            student_id: r.get(0)?,
            student: StudentInfo {
                uid: r.get(1)?,
                name: r.get(2)?,
                division: r.get(3)?,
                batch: r.get(4)?,
            },
            subject_id: r.get(5)?,
            subject: SubjectInfo {
                code: r.get(6)?,
                name: r.get(7)?,
            },
            kind: r.get(8)?,
            conducted: r.get(9)?,
            attended: r.get(10)?,
            percentage: r.get(11)?,
        })
    })?;
    rows.collect()
}

pub fn list_defaulters(
    conn: &Connection,
    query: &DefaulterQuery,
) -> rusqlite::Result<Vec<StudentDefaulters>> {
    let rows = load_rows(conn, query.division.as_deref())?;

    let mut students: BTreeMap<String, StudentInfo> = BTreeMap::new();
    let mut subjects: BTreeMap<String, SubjectInfo> = BTreeMap::new();
    // Periods collapse into one tally per (student, subject, kind).
    let mut tallies: BTreeMap<(String, String, String), Tally> = BTreeMap::new();
    for row in rows {
        if !query.scope.allows(&row.subject_id) {
            continue;
        }
        tallies
            .entry((row.student_id.clone(), row.subject_id.clone(), row.kind))
            .or_default()
            .add(row.conducted, row.attended, row.percentage);
        students.entry(row.student_id).or_insert(row.student);
        subjects.entry(row.subject_id).or_insert(row.subject);
    }

    let mut by_student: BTreeMap<String, Vec<DefaulterSubject>> = BTreeMap::new();
    for ((student_id, subject_id, kind), tally) in tallies {
        let Some(pct) = tally.percentage() else {
            continue;
        };
        if pct >= query.threshold {
            continue;
        }
        let Some(subject) = subjects.get(&subject_id) else {
            continue;
        };
        by_student.entry(student_id).or_default().push(DefaulterSubject {
            subject_id,
            code: subject.code.clone(),
            name: subject.name.clone(),
            kind,
            total_conducted: tally.conducted,
            total_attended: tally.attended,
            percentage: (pct * 100.0).round() / 100.0,
        });
    }

    Ok(by_student
        .into_iter()
        .filter_map(|(student_id, subjects)| {
            let info = students.get(&student_id)?.clone();
            Some(StudentDefaulters {
                student_id,
                uid: info.uid,
                name: info.name,
                division: info.division,
                batch: info.batch,
                subjects,
            })
        })
        .collect())
}

/// Buckets students by their overall percentage across every summary in
/// scope. Students without conducted lectures are left out entirely.
pub fn band_students(
    conn: &Connection,
    scope: &SubjectScope,
    division: Option<&str>,
) -> rusqlite::Result<BandReport> {
    let rows = load_rows(conn, division)?;
    let mut totals: BTreeMap<String, (StudentInfo, i64, f64)> = BTreeMap::new();
    for row in rows {
        if !scope.allows(&row.subject_id) {
            continue;
        }
        let entry = totals
            .entry(row.student_id)
            .or_insert_with(|| (row.student, 0, 0.0));
        entry.1 += row.conducted;
        entry.2 += row.attended;
    }

    let mut report = BandReport::default();
    for (student_id, (info, conducted, attended)) in totals {
        if conducted <= 0 {
            continue;
        }
        let pct = attended / conducted as f64 * 100.0;
        let Some(band) = classify_band(pct) else {
            continue;
        };
        let banded = BandedStudent {
            student_id,
            uid: info.uid,
            name: info.name,
            division: info.division,
            percentage: (pct * 100.0).round() / 100.0,
            band,
        };
        match band {
            DefaulterBand::Below50 => report.below50.push(banded),
            DefaulterBand::Between50And65 => report.between50and65.push(banded),
            DefaulterBand::Between65And75 => report.between65and75.push(banded),
        }
    }
    Ok(report)
}

pub fn spawn_post_upload_check(
    workspace: PathBuf,
    teacher_id: String,
    division: String,
    threshold: f64,
) {
    let spawned = std::thread::Builder::new()
        .name("defaulter-check".to_string())
        .spawn(move || {
            if let Err(e) = post_upload_check(&workspace, &teacher_id, &division, threshold) {
                log::warn!("defaulter check for division {} failed: {:#}", division, e);
            }
        });
    if let Err(e) = spawned {
        log::warn!("could not start defaulter check: {}", e);
    }
}

fn post_upload_check(
    workspace: &std::path::Path,
    teacher_id: &str,
    division: &str,
    threshold: f64,
) -> anyhow::Result<()> {
    let conn = db::open_db(workspace)?;
    let query = DefaulterQuery {
        threshold,
        scope: teacher_scope(&conn, teacher_id)?,
        division: Some(division.to_string()),
    };
    let defaulters = list_defaulters(&conn, &query)?;
    log::info!(
        "division {}: {} defaulters below {}%",
        division,
        defaulters.len(),
        threshold
    );
    if defaulters.is_empty() {
        return Ok(());
    }
    let payload = json!({
        "division": division,
        "threshold": threshold,
        "count": defaulters.len(),
        "studentIds": defaulters.iter().map(|d| d.student_id.as_str()).collect::<Vec<_>>(),
    });
    notify::publish_all(
        &OutboxNotifier::new(&conn),
        &[Audience::User(teacher_id.to_string())],
        notify::EVENT_DEFAULTERS,
        &payload,
    );
    Ok(())
}
