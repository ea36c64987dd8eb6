use crate::batch_info::parse_batch_info;
use crate::error::{IngestError, IngestErrorKind};
use crate::grid::Grid;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubjectKind {
    Theory,
    Practical,
}

impl SubjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Theory => "theory",
            Self::Practical => "practical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "theory" | "th" => Some(Self::Theory),
            "practical" | "lab" => Some(Self::Practical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetSubject {
    pub code: String,
    pub kind: SubjectKind,
    pub total_lectures: Option<u32>,
    pub batch_totals: Option<BTreeMap<char, u32>>,
    pub attended_column: usize,
    pub percentage_column: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderColumns {
    pub roll: usize,
    pub uid: usize,
    pub name: usize,
    pub batch: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetLayout {
    pub header_row: usize,
    pub subject_row: Option<usize>,
    pub category_row: Option<usize>,
    pub theory_start: usize,
    pub lab_start: Option<usize>,
    pub columns: HeaderColumns,
    pub subjects: Vec<SheetSubject>,
    pub period: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct LayoutOptions {
    pub scan_rows: usize,
    pub window_radius: usize,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            scan_rows: 10,
            window_radius: 6,
        }
    }
}

static LAB_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Z]{2,4})\s*(?:\(\s*LAB\s*\)|LAB\b)").expect("lab code regex")
});
static THEORY_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Z]{2,4})\s*(?:\(\s*(?:TH|THEORY)\s*\)|\s+THEORY\b)")
        .expect("theory code regex")
});
static TOTAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"TOTAL\s*[=:\-]?\s*(\d+)").expect("total regex"));
static BARE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z]{2,4})\b").expect("bare code regex"));
static THEORY_CATEGORY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bTHEORY\b").expect("theory category regex"));
static LAB_CATEGORY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:LABS?|PRACTICALS?)\b").expect("lab category regex"));
static PERIOD: Lazy<Regex> = Lazy::new(|| {
    let month = r"(?:JAN|FEB|MAR|APR|MAY|JUN|JUL|AUG|SEP|OCT|NOV|DEC)[A-Z]*";
    Regex::new(&format!(
        r"(?i)\b({m}[-' ]?\d{{2,4}})\s*(?:TO|-|–)\s*({m}[-' ]?\d{{2,4}})\b",
        m = month
    ))
    .expect("period regex")
});

const RESERVED_WORDS: &[&str] = &[
    "TOTAL", "LAB", "LABS", "TH", "ROLL", "UID", "NAME", "DIV", "BATCH", "SR", "NO", "SUB",
];

/// `column` is where the declaration was found, not the attended column.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    Theory {
        code: String,
        total: Option<u32>,
        column: usize,
    },
    Lab {
        code: String,
        batch_totals: BTreeMap<char, u32>,
        column: usize,
    },
    BareCode {
        code: String,
        column: usize,
    },
}

pub struct ScanContext<'a> {
    grid: &'a Grid,
    /// Subject-declaration row first, then the row above it.
    decl_rows: Vec<usize>,
    lab_start: Option<usize>,
    radius: usize,
    claimed: HashSet<usize>,
}

impl<'a> ScanContext<'a> {
    pub fn new(
        grid: &'a Grid,
        subject_row: Option<usize>,
        lab_start: Option<usize>,
        radius: usize,
    ) -> Self {
        let mut decl_rows = Vec::new();
        if let Some(r) = subject_row {
            decl_rows.push(r);
            if r > 0 {
                decl_rows.push(r - 1);
            }
        }
        Self {
            grid,
            decl_rows,
            lab_start,
            radius,
            claimed: HashSet::new(),
        }
    }

    pub fn claim(&mut self, col: usize) {
        self.claimed.insert(col);
    }

    fn upper(&self, row: usize, col: usize) -> String {
        self.grid.cell(row, col).to_ascii_uppercase()
    }

    /// Batch totals from the matched cell, else the other declaration row at
    /// the same column, else the next column over.
    fn batch_totals_near(&self, row: usize, col: usize) -> BTreeMap<char, u32> {
        let mut cells = vec![(row, col)];
        cells.extend(self.decl_rows.iter().filter(|r| **r != row).map(|r| (*r, col)));
        cells.extend(self.decl_rows.iter().map(|r| (*r, col + 1)));
        cells
            .into_iter()
            .map(|(r, c)| parse_batch_info(&self.upper(r, c)))
            .find(|m| !m.is_empty())
            .unwrap_or_default()
    }

    fn total_near(&self, row: usize, col: usize) -> Option<u32> {
        std::iter::once(row)
            .chain(self.decl_rows.iter().copied().filter(|r| *r != row))
            .find_map(|r| {
                TOTAL
                    .captures(&self.upper(r, col))
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<u32>().ok())
            })
    }

    fn window(&self, col: usize) -> Vec<usize> {
        let mut out = vec![col];
        for d in 1..=self.radius {
            if let Some(left) = col.checked_sub(d) {
                out.push(left);
            }
            if col + d < self.grid.width() {
                out.push(col + d);
            }
        }
        out.retain(|c| !self.claimed.contains(c));
        out
    }
}

pub type Matcher = fn(&ScanContext<'_>, usize) -> Option<Candidate>;

pub const MATCHERS: &[Matcher] = &[match_lab_band, match_window, match_bare_code];

/// Inside the lab band: nearest `XX(LAB)` / `XXLAB` declaration at or left of
/// `col`, no further left than where the band starts.
pub fn match_lab_band(ctx: &ScanContext<'_>, col: usize) -> Option<Candidate> {
    let lab_start = ctx.lab_start?;
    if col < lab_start {
        return None;
    }
    for c in (lab_start..=col).rev().filter(|c| !ctx.claimed.contains(c)) {
        for &r in &ctx.decl_rows {
            let text = ctx.upper(r, c);
            if let Some(code) = LAB_CODE.captures(&text).and_then(|m| m.get(1)) {
                return Some(Candidate::Lab {
                    code: code.as_str().to_string(),
                    batch_totals: ctx.batch_totals_near(r, c),
                    column: c,
                });
            }
        }
    }
    None
}

pub fn match_window(ctx: &ScanContext<'_>, col: usize) -> Option<Candidate> {
    for c in ctx.window(col) {
        for &r in &ctx.decl_rows {
            let text = ctx.upper(r, c);
            if let Some(code) = THEORY_CODE.captures(&text).and_then(|m| m.get(1)) {
                return Some(Candidate::Theory {
                    code: code.as_str().to_string(),
                    total: ctx.total_near(r, c),
                    column: c,
                });
            }
            if let Some(code) = LAB_CODE.captures(&text).and_then(|m| m.get(1)) {
                return Some(Candidate::Lab {
                    code: code.as_str().to_string(),
                    batch_totals: ctx.batch_totals_near(r, c),
                    column: c,
                });
            }
        }
    }
    None
}

pub fn match_bare_code(ctx: &ScanContext<'_>, col: usize) -> Option<Candidate> {
    for c in ctx.window(col) {
        for &r in &ctx.decl_rows {
            let text = ctx.grid.cell(r, c).trim();
            let Some(code) = BARE_CODE.captures(text).and_then(|m| m.get(1)) else {
                continue;
            };
            if RESERVED_WORDS.contains(&code.as_str()) {
                continue;
            }
            return Some(Candidate::BareCode {
                code: code.as_str().to_string(),
                column: c,
            });
        }
    }
    None
}

pub fn classify_column(ctx: &ScanContext<'_>, col: usize) -> Option<Candidate> {
    MATCHERS.iter().find_map(|m| m(ctx, col))
}

impl Candidate {
    pub fn declaration_column(&self) -> usize {
        match self {
            Candidate::Theory { column, .. }
            | Candidate::Lab { column, .. }
            | Candidate::BareCode { column, .. } => *column,
        }
    }

    fn into_subject(
        self,
        lab_start: Option<usize>,
        attended_column: usize,
        percentage_column: Option<usize>,
    ) -> SheetSubject {
        let (code, kind, total_lectures, batch_totals) = match self {
            Candidate::Theory { code, total, .. } => (code, SubjectKind::Theory, total, None),
            Candidate::Lab {
                code, batch_totals, ..
            } => {
                let totals = (!batch_totals.is_empty()).then_some(batch_totals);
                (code, SubjectKind::Practical, None, totals)
            }
            Candidate::BareCode { code, column } => {
                let kind = match lab_start {
                    Some(ls) if column >= ls => SubjectKind::Practical,
                    _ => SubjectKind::Theory,
                };
                (code, kind, None, None)
            }
        };
        SheetSubject {
            code,
            kind,
            total_lectures,
            batch_totals,
            attended_column,
            percentage_column,
        }
    }
}

fn find_header_row(grid: &Grid, scan_rows: usize) -> Option<usize> {
    (0..grid.len().min(scan_rows)).find(|&i| {
        let text = grid
            .row(i)
            .map(|cells| cells.join(" "))
            .unwrap_or_default()
            .to_ascii_uppercase();
        text.contains("ROLL") && (text.contains("UID") || text.contains("STUDENT"))
    })
}

fn find_categories(grid: &Grid, category_row: Option<usize>) -> (usize, Option<usize>) {
    let Some(r) = category_row else {
        return (0, None);
    };
    let mut theory_start = None;
    let mut lab_start = None;
    for c in 0..grid.width() {
        let text = grid.cell(r, c).to_ascii_uppercase();
        if theory_start.is_none() && THEORY_CATEGORY.is_match(&text) {
            theory_start = Some(c);
        }
        if lab_start.is_none() && LAB_CATEGORY.is_match(&text) {
            lab_start = Some(c);
        }
    }
    (theory_start.unwrap_or(0), lab_start)
}

fn find_header_columns(grid: &Grid, header_row: usize) -> Result<HeaderColumns, IngestError> {
    let headers: Vec<String> = (0..grid.width())
        .map(|c| grid.cell(header_row, c).to_ascii_uppercase())
        .collect();
    let find = |pred: &dyn Fn(usize, &str) -> bool| {
        headers.iter().enumerate().find(|(i, h)| pred(*i, h)).map(|(i, _)| i)
    };

    let roll = find(&|_, h| h.contains("ROLL"));
    let uid = find(&|_, h| h.contains("UID"));
    let name = find(&|_, h| h.contains("NAME")).or_else(|| {
        find(&|i, h| h.contains("STUDENT") && Some(i) != uid && Some(i) != roll)
    });
    let batch = find(&|_, h| h.contains("DIV") || h.contains("BATCH"));

    match (roll, uid, name) {
        (Some(roll), Some(uid), Some(name)) => Ok(HeaderColumns {
            roll,
            uid,
            name,
            batch,
        }),
        _ => {
            let missing: Vec<&str> = [("Roll", roll), ("UID", uid), ("Name", name)]
                .into_iter()
                .filter(|(_, v)| v.is_none())
                .map(|(n, _)| n)
                .collect();
            Err(IngestError::new(
                IngestErrorKind::MissingColumns,
                format!("header row is missing required columns: {}", missing.join(", ")),
            )
            .with_details(json!({
                "missing": missing,
                "headerRow": header_row + 1,
                "header": grid.row(header_row).unwrap_or(&[]),
            })))
        }
    }
}

pub fn extract_period(grid: &Grid, header_row: usize) -> Option<String> {
    for r in 0..header_row {
        let Some(cells) = grid.row(r) else { continue };
        for cell in cells {
            if let Some(caps) = PERIOD.captures(cell) {
                let from = caps.get(1)?.as_str().trim();
                let to = caps.get(2)?.as_str().trim();
                return Some(format!("{} to {}", from, to));
            }
        }
    }
    None
}

fn excerpt(grid: &Grid, rows: impl Iterator<Item = usize>) -> serde_json::Value {
    let rows: Vec<serde_json::Value> = rows
        .map(|r| {
            let cells: Vec<String> = grid
                .row(r)
                .unwrap_or(&[])
                .iter()
                .take(30)
                .map(|c| c.chars().take(40).collect())
                .collect();
            json!({ "row": r + 1, "cells": cells })
        })
        .collect();
    json!(rows)
}

pub fn infer_layout(grid: &Grid, opts: LayoutOptions) -> Result<SheetLayout, IngestError> {
    let Some(header_row) = find_header_row(grid, opts.scan_rows) else {
        return Err(IngestError::new(
            IngestErrorKind::HeaderNotFound,
            format!(
                "no header row with ROLL and UID/STUDENT in the first {} rows",
                opts.scan_rows
            ),
        )
        .with_details(json!({
            "rows": excerpt(grid, 0..grid.len().min(opts.scan_rows)),
        })));
    };
    let subject_row = header_row.checked_sub(1);
    let category_row = header_row.checked_sub(2);
    let (theory_start, lab_start) = find_categories(grid, category_row);
    let columns = find_header_columns(grid, header_row)?;

    let mut ctx = ScanContext::new(grid, subject_row, lab_start, opts.window_radius);
    let mut seen: HashSet<(String, SubjectKind, usize)> = HashSet::new();
    let mut subjects = Vec::new();
    for col in 0..grid.width() {
        let header = grid.cell(header_row, col).to_lowercase();
        if !header.contains("attended") || header.contains('%') {
            continue;
        }
        let Some(candidate) = classify_column(&ctx, col) else {
            log::debug!("attended column {} has no subject declaration nearby", col + 1);
            continue;
        };
        ctx.claim(candidate.declaration_column());
        let percentage_column =
            Some(col + 1).filter(|c| grid.cell(header_row, *c).contains('%'));
        let subject = candidate.into_subject(lab_start, col, percentage_column);
        if seen.insert((subject.code.clone(), subject.kind, col)) {
            subjects.push(subject);
        }
    }

    if subjects.is_empty() {
        let first = category_row.unwrap_or(subject_row.unwrap_or(header_row));
        return Err(IngestError::new(
            IngestErrorKind::NoSubjectsDetected,
            "no subject attendance columns could be matched to a subject code",
        )
        .with_details(json!({
            "headerRow": header_row + 1,
            "theoryStart": theory_start + 1,
            "labStart": lab_start.map(|c| c + 1),
            "rows": excerpt(grid, first..=header_row),
        })));
    }

    Ok(SheetLayout {
        header_row,
        subject_row,
        category_row,
        theory_start,
        lab_start,
        columns,
        subjects,
        period: extract_period(grid, header_row),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: &[&[&str]]) -> Grid {
        Grid::from_rows(
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    fn sample() -> Grid {
        grid(&[
            &["Attendance Report Aug-25 to Oct-25", "", "", "", "", "", "", "", "", ""],
            &["", "", "", "", "Theory Subjects", "", "", "", "Lab Subjects", ""],
            &["", "", "", "", "SE(Th) Total=32", "", "CN(TH) TOTAL: 30", "", "DBMS(LAB) A= 10, B= 11", ""],
            &["Roll", "UID", "Name", "Batch", "SE attended", "% attended", "CN attended", "% attended", "DBMS attended", "% attended"],
            &["1", "U1", "Asha", "A", "28", "87.5", "20", "66.67", "9", "90"],
        ])
    }

    #[test]
    fn finds_rows_columns_and_bands() {
        let layout = infer_layout(&sample(), LayoutOptions::default()).expect("layout");
        assert_eq!(layout.header_row, 3);
        assert_eq!(layout.subject_row, Some(2));
        assert_eq!(layout.category_row, Some(1));
        assert_eq!(layout.theory_start, 4);
        assert_eq!(layout.lab_start, Some(8));
        assert_eq!(
            layout.columns,
            HeaderColumns {
                roll: 0,
                uid: 1,
                name: 2,
                batch: Some(3)
            }
        );
        assert_eq!(layout.period.as_deref(), Some("Aug-25 to Oct-25"));
    }

    #[test]
    fn classifies_theory_and_lab_subjects() {
        let layout = infer_layout(&sample(), LayoutOptions::default()).expect("layout");
        let codes: Vec<(&str, SubjectKind)> = layout
            .subjects
            .iter()
            .map(|s| (s.code.as_str(), s.kind))
            .collect();
        assert_eq!(
            codes,
            vec![
                ("SE", SubjectKind::Theory),
                ("CN", SubjectKind::Theory),
                ("DBMS", SubjectKind::Practical)
            ]
        );
        assert_eq!(layout.subjects[0].total_lectures, Some(32));
        assert_eq!(layout.subjects[0].percentage_column, Some(5));
        assert_eq!(layout.subjects[1].total_lectures, Some(30));
        let lab = &layout.subjects[2];
        assert_eq!(lab.attended_column, 8);
        let totals = lab.batch_totals.as_ref().expect("batch totals");
        assert_eq!(totals.get(&'A'), Some(&10));
        assert_eq!(totals.get(&'B'), Some(&11));
    }

    #[test]
    fn lab_band_matcher_looks_left_to_band_start() {
        let g = grid(&[
            &["", "", "Lab Subjects", "", ""],
            &["", "", "CNLAB A=8", "", ""],
            &["Roll", "UID", "x", "CN attended", "% attended"],
        ]);
        let ctx = ScanContext::new(&g, Some(1), Some(2), 6);
        assert_eq!(
            match_lab_band(&ctx, 3),
            Some(Candidate::Lab {
                code: "CN".to_string(),
                batch_totals: [('A', 8)].into_iter().collect(),
                column: 2
            })
        );
        assert_eq!(match_lab_band(&ctx, 1), None);
    }

    #[test]
    fn bare_code_matcher_skips_reserved_words() {
        let g = grid(&[
            &["", "TOTAL", "", "OS", ""],
            &["Roll", "UID", "Name", "x attended", ""],
        ]);
        let ctx = ScanContext::new(&g, Some(0), None, 6);
        assert_eq!(match_window(&ctx, 3), None);
        assert_eq!(
            match_bare_code(&ctx, 3),
            Some(Candidate::BareCode {
                code: "OS".to_string(),
                column: 3
            })
        );
    }

    #[test]
    fn missing_header_is_reported_with_excerpt() {
        let g = grid(&[&["Name", "Marks"], &["Asha", "10"]]);
        let e = infer_layout(&g, LayoutOptions::default()).expect_err("no header");
        assert_eq!(e.kind, IngestErrorKind::HeaderNotFound);
        assert!(e.details.is_some());
    }

    #[test]
    fn missing_name_column_is_fatal() {
        let g = grid(&[&["SE(TH)", "", ""], &["Roll", "UID", "SE attended"]]);
        let e = infer_layout(&g, LayoutOptions::default()).expect_err("missing name");
        assert_eq!(e.kind, IngestErrorKind::MissingColumns);
    }

    #[test]
    fn no_subject_columns_is_fatal() {
        let g = grid(&[&["", "", "", ""], &["Roll", "UID", "Name", "Remarks"]]);
        let e = infer_layout(&g, LayoutOptions::default()).expect_err("no subjects");
        assert_eq!(e.kind, IngestErrorKind::NoSubjectsDetected);
    }

    #[test]
    fn a_declaration_is_claimed_by_one_column_only() {
        let g = grid(&[
            &["", "", "", "OS(TH)", "", ""],
            &["Roll", "UID", "Name", "OS attended", "% attended", "OS attended"],
        ]);
        let layout = infer_layout(&g, LayoutOptions::default()).expect("layout");
        assert_eq!(layout.subjects.len(), 1);
        assert_eq!(layout.subjects[0].attended_column, 3);
    }

    #[test]
    fn declarations_over_percentage_columns_pair_with_their_own_subject() {
        let g = grid(&[
            &["", "", "", "", "", "SE(TH) TOTAL=32", "", "CN(TH) TOTAL=30"],
            &["Roll", "UID", "Name", "Batch", "SE attended", "% attended", "CN attended", "% attended"],
        ]);
        let layout = infer_layout(&g, LayoutOptions::default()).expect("layout");
        let found: Vec<(&str, usize, Option<u32>)> = layout
            .subjects
            .iter()
            .map(|s| (s.code.as_str(), s.attended_column, s.total_lectures))
            .collect();
        assert_eq!(found, vec![("SE", 4, Some(32)), ("CN", 6, Some(30))]);
    }

    #[test]
    fn category_words_must_stand_alone() {
        let g = grid(&[
            &["Syllabus status", "", "", "", "Theory Subjects", "", "Collaborative"],
            &["", "", "", "", "SE", "", ""],
            &["Roll", "UID", "Name", "Batch", "SE attended", "% attended", ""],
        ]);
        let layout = infer_layout(&g, LayoutOptions::default()).expect("layout");
        assert_eq!(layout.theory_start, 4);
        assert_eq!(layout.lab_start, None);
        assert_eq!(layout.subjects[0].kind, SubjectKind::Theory);

        let g = grid(&[
            &["", "Practicals", "", "Labs"],
            &["", "", "", ""],
            &["Roll", "UID", "Name", ""],
        ]);
        assert_eq!(find_categories(&g, Some(0)), (0, Some(1)));
    }
}
