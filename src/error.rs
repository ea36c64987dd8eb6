use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestErrorKind {
    UnsupportedFormat,
    HeaderNotFound,
    MissingColumns,
    NoSubjectsDetected,
    NoSubjectMatch,
    NoStudentsInDivision,
    StudentNotFound,
    InvalidAttendedValue,
    Storage,
    Io,
}

impl IngestErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::UnsupportedFormat => "unsupported_format",
            Self::HeaderNotFound => "header_not_found",
            Self::MissingColumns => "missing_columns",
            Self::NoSubjectsDetected => "no_subjects_detected",
            Self::NoSubjectMatch => "no_subject_match",
            Self::NoStudentsInDivision => "no_students_in_division",
            Self::StudentNotFound => "student_not_found",
            Self::InvalidAttendedValue => "invalid_attended_value",
            Self::Storage => "storage_failed",
            Self::Io => "io_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestError {
    pub kind: IngestErrorKind,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl IngestError {
    pub fn new(kind: IngestErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for IngestError {}

impl From<rusqlite::Error> for IngestError {
    fn from(e: rusqlite::Error) -> Self {
        Self::new(IngestErrorKind::Storage, e.to_string())
    }
}

impl From<std::io::Error> for IngestError {
    fn from(e: std::io::Error) -> Self {
        Self::new(IngestErrorKind::Io, e.to_string())
    }
}

/// A problem with a single sheet row; collected, never fatal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub row: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub code: &'static str,
    pub message: String,
}

impl RowError {
    pub fn new(
        row_index: usize,
        uid: Option<&str>,
        kind: IngestErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            row: row_index + 1,
            uid: uid.map(|s| s.to_string()),
            code: kind.code(),
            message: message.into(),
        }
    }
}
