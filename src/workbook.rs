//! In-memory spreadsheet model for uploads and downloadable templates.
//!
//! Excel/ODS files go through calamine; `.csv` files become a single sheet
//! named after the file stem.

use anyhow::{anyhow, Context};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::io::Cursor;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn text(s: impl Into<String>) -> Self {
        let s = s.into();
        if s.trim().is_empty() {
            Cell::Empty
        } else {
            Cell::Text(s)
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Number(_) => false,
            Cell::Text(s) => s.trim().is_empty(),
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Cell::Number(n) => n.to_string(),
            Cell::Text(s) => s.trim().to_string(),
        }
    }

    /// `Ok(None)` for blank cells, `Err` for text that is not a number.
    pub fn as_number(&self) -> Result<Option<f64>, String> {
        match self {
            Cell::Empty => Ok(None),
            Cell::Number(n) => Ok(Some(*n)),
            Cell::Text(s) => {
                let t = s.trim();
                if t.is_empty() {
                    return Ok(None);
                }
                t.parse::<f64>()
                    .map(Some)
                    .map_err(|_| format!("'{}' is not a number", t))
            }
        }
    }

    /// Accepts `YYYY-MM-DD`, `DD/MM/YYYY` or an Excel serial day number.
    pub fn as_date(&self) -> Result<Option<NaiveDate>, String> {
        match self {
            Cell::Empty => Ok(None),
            Cell::Number(n) => excel_serial_to_date(*n)
                .map(Some)
                .ok_or_else(|| format!("{} is not a valid date", n)),
            Cell::Text(s) => {
                let t = s.trim();
                if t.is_empty() {
                    return Ok(None);
                }
                NaiveDate::parse_from_str(t, "%Y-%m-%d")
                    .or_else(|_| NaiveDate::parse_from_str(t, "%d/%m/%Y"))
                    .map(Some)
                    .map_err(|_| format!("'{}' is not a date (use YYYY-MM-DD)", t))
            }
        }
    }
}

pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_days(chrono::Days::new(serial.floor() as u64))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
}

impl Sheet {
    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&Cell::Empty)
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        for row in &self.rows {
            let line: Vec<String> = row.iter().map(|c| csv_quote(&c.as_text())).collect();
            out.push_str(&line.join(","));
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

pub fn load(file_name: &str, bytes: Vec<u8>) -> anyhow::Result<Workbook> {
    let lower = file_name.trim().to_ascii_lowercase();
    if lower.ends_with(".csv") {
        let text = String::from_utf8(bytes).context("csv upload is not valid UTF-8")?;
        let text = text.trim_start_matches('\u{feff}');
        return Ok(Workbook {
            sheets: vec![parse_csv(file_stem(file_name), text)],
        });
    }

    let mut wb = open_workbook_auto_from_rs(Cursor::new(bytes))
        .with_context(|| format!("failed to open spreadsheet {}", file_name))?;
    let mut sheets = Vec::new();
    for name in wb.sheet_names() {
        let range = wb
            .worksheet_range(&name)
            .with_context(|| format!("failed to read sheet {}", name))?;
        let rows = range
            .rows()
            .map(|r| r.iter().map(cell_from_data).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        sheets.push(Sheet { name, rows });
    }
    if sheets.is_empty() {
        return Err(anyhow!("spreadsheet {} has no sheets", file_name));
    }
    Ok(Workbook { sheets })
}

fn cell_from_data(d: &Data) -> Cell {
    match d {
        Data::Empty => Cell::Empty,
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Float(f) => Cell::Number(*f),
        Data::String(s) => Cell::text(s.clone()),
        Data::Bool(b) => Cell::Text(b.to_string()),
        Data::DateTime(dt) => Cell::Number(dt.as_f64()),
        other => Cell::text(other.to_string()),
    }
}

fn file_stem(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);
    match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => base.to_string(),
    }
}

pub fn parse_csv(name: impl Into<String>, text: &str) -> Sheet {
    let rows = parse_csv_records(text)
        .into_iter()
        .map(|record| record.into_iter().map(Cell::text).collect::<Vec<_>>())
        .collect();
    Sheet {
        name: name.into(),
        rows,
    }
}

/// Splits CSV text into records. Line breaks inside a quoted field belong to
/// the field; `\r\n`, `\n` and a lone `\r` end a record outside quotes.
fn parse_csv_records(text: &str) -> Vec<Vec<String>> {
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                buf.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => record.push(std::mem::take(&mut buf)),
            '\r' | '\n' if !in_quotes => {
                if ch == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                record.push(std::mem::take(&mut buf));
                records.push(std::mem::take(&mut record));
            }
            _ => buf.push(ch),
        }
    }
    if !buf.is_empty() || !record.is_empty() || in_quotes {
        record.push(buf);
        records.push(record);
    }
    records
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Lowercase ASCII alphanumerics only, so "Basic Science " and
/// "basic-science" compare equal.
pub fn normalize_name(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// A logical column and the header spellings that name it.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub key: &'static str,
    pub aliases: &'static [&'static str],
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderRow {
    pub row: usize,
    pub columns: HashMap<&'static str, usize>,
}

impl HeaderRow {
    pub fn col(&self, key: &str) -> Option<usize> {
        self.columns.get(key).copied()
    }
}

/// First row (within the first 10) whose cells name every `required` column.
pub fn find_header(
    sheet: &Sheet,
    specs: &[ColumnSpec],
    required: &[&str],
) -> Option<HeaderRow> {
    find_header_where(sheet, specs, |cols| {
        required.iter().all(|k| cols.contains_key(*k))
    })
}

pub fn find_header_where<F>(sheet: &Sheet, specs: &[ColumnSpec], accept: F) -> Option<HeaderRow>
where
    F: Fn(&HashMap<&'static str, usize>) -> bool,
{
    for (row_idx, row) in sheet.rows.iter().enumerate().take(10) {
        let mut columns = HashMap::new();
        for (col_idx, cell) in row.iter().enumerate() {
            let norm = normalize_name(&cell.as_text());
            if norm.is_empty() {
                continue;
            }
            for spec in specs {
                if columns.contains_key(spec.key) {
                    continue;
                }
                if spec.aliases.iter().any(|a| normalize_name(a) == norm) {
                    columns.insert(spec.key, col_idx);
                    break;
                }
            }
        }
        if !columns.is_empty() && accept(&columns) {
            return Some(HeaderRow {
                row: row_idx,
                columns,
            });
        }
    }
    None
}
