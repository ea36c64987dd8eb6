use crate::error::{IngestError, IngestErrorKind};
use calamine::{Data, Ods, Range, Reader, Xls, Xlsx};
use std::fmt::Debug;
use std::io::{Cursor, Read, Seek};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Delimited,
    Xlsx,
    Xls,
    Ods,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "csv" | "txt" => Ok(Self::Delimited),
            "xlsx" | "xlsm" => Ok(Self::Xlsx),
            "xls" => Ok(Self::Xls),
            "ods" => Ok(Self::Ods),
            _ => Err(IngestError::new(
                IngestErrorKind::UnsupportedFormat,
                format!("unsupported file extension: {:?}", ext),
            )
            .with_details(serde_json::json!({ "accepted": ["csv", "txt", "xlsx", "xlsm", "xls", "ods"] }))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Grid {
    rows: Vec<Vec<String>>,
    width: usize,
}

impl Grid {
    pub fn from_rows(mut rows: Vec<Vec<String>>) -> Self {
        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
        for r in rows.iter_mut() {
            r.resize(width, String::new());
        }
        Self { rows, width }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Out-of-range lookups read as empty cells.
    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    pub fn row(&self, row: usize) -> Option<&[String]> {
        self.rows.get(row).map(|r| r.as_slice())
    }
}

pub fn normalize(bytes: &[u8], kind: FileKind) -> Result<Grid, IngestError> {
    match kind {
        FileKind::Delimited => normalize_delimited(bytes),
        FileKind::Xlsx => {
            let wb = Xlsx::new(Cursor::new(bytes.to_vec())).map_err(spreadsheet_err)?;
            first_sheet(wb)
        }
        FileKind::Xls => {
            let wb = Xls::new(Cursor::new(bytes.to_vec())).map_err(spreadsheet_err)?;
            first_sheet(wb)
        }
        FileKind::Ods => {
            let wb = Ods::new(Cursor::new(bytes.to_vec())).map_err(spreadsheet_err)?;
            first_sheet(wb)
        }
    }
}

pub fn normalize_file(path: &Path) -> Result<Grid, IngestError> {
    let kind = FileKind::from_path(path)?;
    let bytes = std::fs::read(path)?;
    normalize(&bytes, kind)
}

fn normalize_delimited(bytes: &[u8]) -> Result<Grid, IngestError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut rows = Vec::new();
    for rec in rdr.records() {
        let rec = rec.map_err(|e| {
            IngestError::new(
                IngestErrorKind::UnsupportedFormat,
                format!("unreadable delimited text: {}", e),
            )
        })?;
        rows.push(rec.iter().map(|c| c.to_string()).collect());
    }
    Ok(Grid::from_rows(rows))
}

fn first_sheet<RS, R>(mut wb: R) -> Result<Grid, IngestError>
where
    RS: Read + Seek,
    R: Reader<RS>,
    R::Error: Debug,
{
    let range = wb
        .worksheet_range_at(0)
        .ok_or_else(|| IngestError::new(IngestErrorKind::UnsupportedFormat, "workbook has no sheets"))?
        .map_err(spreadsheet_err)?;
    Ok(range_to_grid(&range))
}

fn range_to_grid(range: &Range<Data>) -> Grid {
    // calamine trims the used range; keep sheet coordinates intact.
    let (row_off, col_off) = range
        .start()
        .map(|(r, c)| (r as usize, c as usize))
        .unwrap_or((0, 0));
    let mut rows: Vec<Vec<String>> = vec![Vec::new(); row_off];
    for row in range.rows() {
        let mut cells = vec![String::new(); col_off];
        cells.extend(row.iter().map(cell_to_string));
        rows.push(cells);
    }
    Grid::from_rows(rows)
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

fn spreadsheet_err<E: Debug>(e: E) -> IngestError {
    IngestError::new(
        IngestErrorKind::UnsupportedFormat,
        format!("unreadable spreadsheet: {:?}", e),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimited_rows_are_padded_to_rectangle() {
        let text = "\u{feff}Title,,\nRoll,UID,Name,Batch\n1,U1\n";
        let grid = normalize(text.as_bytes(), FileKind::Delimited).expect("normalize");
        assert_eq!(grid.len(), 3);
        assert_eq!(grid.width(), 4);
        assert_eq!(grid.cell(0, 0), "Title");
        assert_eq!(grid.cell(2, 3), "");
        assert_eq!(grid.cell(9, 9), "");
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let e = FileKind::from_path(Path::new("upload.pdf")).expect_err("pdf rejected");
        assert_eq!(e.kind, IngestErrorKind::UnsupportedFormat);
        assert_eq!(
            FileKind::from_path(Path::new("SHEET.XLSX")).expect("xlsx"),
            FileKind::Xlsx
        );
    }

    #[test]
    fn xlsx_first_sheet_reads_raw_strings() {
        let mut wb = rust_xlsxwriter::Workbook::new();
        let ws = wb.add_worksheet();
        ws.write_string(1, 1, "SE(Th) Total=32").expect("write");
        ws.write_number(2, 2, 28.0).expect("write");
        let bytes = wb.save_to_buffer().expect("save xlsx");

        let grid = normalize(&bytes, FileKind::Xlsx).expect("normalize xlsx");
        assert_eq!(grid.cell(0, 0), "");
        assert_eq!(grid.cell(1, 1), "SE(Th) Total=32");
        assert_eq!(grid.cell(2, 2), "28");
        assert_eq!(grid.cell(2, 1), "");
    }
}
