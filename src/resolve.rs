use crate::error::{IngestError, IngestErrorKind};
use crate::layout::SheetSubject;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalSubject {
    pub id: String,
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    ExactCode,
    NameContains,
    CodeContains,
}

#[derive(Debug, Clone)]
pub struct ResolvedSubject {
    pub sheet: SheetSubject,
    pub subject: CanonicalSubject,
    pub rule: MatchRule,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub matched: Vec<ResolvedSubject>,
    pub unmatched: Vec<SheetSubject>,
    /// Columns that resolved to a (subject, kind) an earlier column already
    /// holds. Their values are not written.
    pub duplicates: Vec<SheetSubject>,
}

pub fn load_catalog(conn: &Connection) -> rusqlite::Result<Vec<CanonicalSubject>> {
    let mut stmt = conn.prepare("SELECT id, name, code FROM subjects ORDER BY code, name")?;
    let rows = stmt.query_map([], |r| {
        Ok(CanonicalSubject {
            id: r.get(0)?,
            name: r.get(1)?,
            code: r.get(2)?,
        })
    })?;
    rows.collect()
}

fn contains_either(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.contains(b) || b.contains(a)
}

/// Picks the canonical subject for one sheet code. Rules are tried in order
/// over the whole catalog, so an exact code anywhere beats a fuzzy hit earlier
/// in the list.
pub fn match_subject<'a>(
    code: &str,
    catalog: &'a [CanonicalSubject],
) -> Option<(&'a CanonicalSubject, MatchRule)> {
    let code = code.trim().to_lowercase();
    if code.is_empty() {
        return None;
    }
    if let Some(s) = catalog
        .iter()
        .find(|s| s.code.trim().to_lowercase() == code)
    {
        return Some((s, MatchRule::ExactCode));
    }
    if let Some(s) = catalog
        .iter()
        .find(|s| contains_either(&s.name.trim().to_lowercase(), &code))
    {
        return Some((s, MatchRule::NameContains));
    }
    catalog
        .iter()
        .find(|s| contains_either(&s.code.trim().to_lowercase(), &code))
        .map(|s| (s, MatchRule::CodeContains))
}

pub fn resolve_subjects(
    sheet: &[SheetSubject],
    catalog: &[CanonicalSubject],
) -> Result<Resolution, IngestError> {
    let mut out = Resolution::default();
    let mut taken = HashSet::new();
    for s in sheet {
        match match_subject(&s.code, catalog) {
            Some((subject, _)) if !taken.insert((subject.id.clone(), s.kind)) => {
                log::warn!(
                    "sheet subject {} ({}) in column {} maps to {} which an earlier column already holds",
                    s.code,
                    s.kind.as_str(),
                    s.attended_column + 1,
                    subject.code
                );
                out.duplicates.push(s.clone());
            }
            Some((subject, rule)) => out.matched.push(ResolvedSubject {
                sheet: s.clone(),
                subject: subject.clone(),
                rule,
            }),
            None => out.unmatched.push(s.clone()),
        }
    }

    if out.matched.is_empty() {
        let sheet_codes: Vec<&str> = sheet.iter().map(|s| s.code.as_str()).collect();
        let catalog_codes: Vec<&str> = catalog.iter().map(|s| s.code.as_str()).collect();
        return Err(IngestError::new(
            IngestErrorKind::NoSubjectMatch,
            "none of the sheet's subjects match a known subject",
        )
        .with_details(json!({
            "sheetCodes": sheet_codes,
            "catalogCodes": catalog_codes,
        })));
    }
    for m in &out.matched {
        log::debug!(
            "sheet subject {} ({}) -> {} via {:?}",
            m.sheet.code,
            m.sheet.kind.as_str(),
            m.subject.code,
            m.rule
        );
    }
    for s in &out.unmatched {
        log::warn!("sheet subject {} ({}) has no catalog match", s.code, s.kind.as_str());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SubjectKind;

    fn subject(id: &str, name: &str, code: &str) -> CanonicalSubject {
        CanonicalSubject {
            id: id.to_string(),
            name: name.to_string(),
            code: code.to_string(),
        }
    }

    fn sheet(code: &str) -> SheetSubject {
        SheetSubject {
            code: code.to_string(),
            kind: SubjectKind::Theory,
            total_lectures: None,
            batch_totals: None,
            attended_column: 4,
            percentage_column: None,
        }
    }

    #[test]
    fn exact_code_wins_over_earlier_fuzzy_candidates() {
        let catalog = vec![
            subject("s1", "Software Engineering Lab SE", "SEL"),
            subject("s2", "Software Engineering", "se"),
        ];
        let (hit, rule) = match_subject("SE", &catalog).expect("match");
        assert_eq!(hit.id, "s2");
        assert_eq!(rule, MatchRule::ExactCode);
    }

    #[test]
    fn falls_back_to_name_then_code_substring() {
        let catalog = vec![
            subject("s1", "Database Management (DBMS)", "CS301"),
            subject("s2", "Operating Systems", "CSOS-2"),
        ];
        let (hit, rule) = match_subject("dbms", &catalog).expect("name match");
        assert_eq!((hit.id.as_str(), rule), ("s1", MatchRule::NameContains));
        let (hit, rule) = match_subject("OS", &catalog).expect("code match");
        assert_eq!(hit.id, "s2");
        assert_eq!(rule, MatchRule::CodeContains);
    }

    #[test]
    fn unmatched_subjects_are_reported_not_fatal() {
        let catalog = vec![subject("s1", "Computer Networks", "CN")];
        let res = resolve_subjects(&[sheet("CN"), sheet("XYZ")], &catalog).expect("resolve");
        assert_eq!(res.matched.len(), 1);
        assert_eq!(res.unmatched.len(), 1);
        assert_eq!(res.unmatched[0].code, "XYZ");
    }

    #[test]
    fn second_column_for_the_same_subject_is_held_back() {
        let catalog = vec![subject("s1", "Software Engineering", "SE")];
        let mut later = sheet("se");
        later.attended_column = 6;
        let res = resolve_subjects(&[sheet("SE"), later], &catalog).expect("resolve");
        assert_eq!(res.matched.len(), 1);
        assert_eq!(res.matched[0].sheet.attended_column, 4);
        assert_eq!(res.duplicates.len(), 1);
        assert_eq!(res.duplicates[0].attended_column, 6);
    }

    #[test]
    fn zero_matches_is_fatal_with_both_code_lists() {
        let catalog = vec![subject("s1", "Computer Networks", "CN")];
        let e = resolve_subjects(&[sheet("XYZ")], &catalog).expect_err("no match");
        assert_eq!(e.kind, IngestErrorKind::NoSubjectMatch);
        let details = e.details.expect("details");
        assert_eq!(details["sheetCodes"], json!(["XYZ"]));
        assert_eq!(details["catalogCodes"], json!(["CN"]));
    }
}
