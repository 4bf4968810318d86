use crate::directory::{self, BatchReport, StudentRow};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("failed to read roster {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("spreadsheet files are not supported, export the sheet as CSV: {0}")]
    UnsupportedSpreadsheet(String),
    #[error("please upload a CSV file: {0}")]
    UnsupportedExtension(String),
    #[error("roster is not plain text, save it as a UTF-8 CSV")]
    NotText,
    #[error("roster is empty")]
    Empty,
}

/// Target of a recognised source column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Roll,
    PersonalEmail,
    CollegeEmail,
    Phone,
    Address,
    Section,
    Year,
    IsRegistered,
    Present,
    HasPaid,
    TransactionId,
    PaymentQr,
    JoinedGroup,
    DockerSkill,
    HasUsedDocker,
}

/// Every header the importer understands, compared case-insensitively after
/// trimming. Anything else is ignored and reported back.
pub const COLUMNS: &[(&str, Field)] = &[
    ("name", Field::Name),
    ("full name", Field::Name),
    ("student name", Field::Name),
    ("university roll no.", Field::Roll),
    ("university roll no", Field::Roll),
    ("roll no.", Field::Roll),
    ("roll no", Field::Roll),
    ("roll number", Field::Roll),
    ("roll", Field::Roll),
    ("personal email", Field::PersonalEmail),
    ("personal email id", Field::PersonalEmail),
    ("personal_email", Field::PersonalEmail),
    ("email", Field::PersonalEmail),
    ("college email", Field::CollegeEmail),
    ("college email id", Field::CollegeEmail),
    ("college_email", Field::CollegeEmail),
    ("phone", Field::Phone),
    ("phone number", Field::Phone),
    ("mobile", Field::Phone),
    ("contact number", Field::Phone),
    ("address", Field::Address),
    ("section", Field::Section),
    ("branch", Field::Section),
    ("year", Field::Year),
    ("is registered", Field::IsRegistered),
    ("is_registered", Field::IsRegistered),
    ("registered", Field::IsRegistered),
    ("present", Field::Present),
    ("has paid", Field::HasPaid),
    ("has_paid", Field::HasPaid),
    ("paid", Field::HasPaid),
    ("transaction id", Field::TransactionId),
    ("transaction_id", Field::TransactionId),
    ("payment qr", Field::PaymentQr),
    ("payment_qr", Field::PaymentQr),
    ("payment screenshot", Field::PaymentQr),
    ("joined group", Field::JoinedGroup),
    ("joined_group", Field::JoinedGroup),
    ("joined whatsapp group", Field::JoinedGroup),
    ("docker skill", Field::DockerSkill),
    ("docker_skill", Field::DockerSkill),
    ("has used docker", Field::HasUsedDocker),
    ("has_used_docker", Field::HasUsedDocker),
    ("used docker before", Field::HasUsedDocker),
];

pub fn lookup_column(header: &str) -> Option<Field> {
    let key = header.trim().to_ascii_lowercase();
    COLUMNS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, field)| *field)
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "y" | "1"
    )
}

/// Residence is not a roster column; it is read off the address.
pub fn is_hosteller_address(address: &str) -> bool {
    address.to_ascii_lowercase().contains("hostel")
}

fn strip_quotes(raw: &str) -> String {
    let t = raw.trim();
    let t = t.strip_prefix('"').unwrap_or(t);
    let t = t.strip_suffix('"').unwrap_or(t);
    t.to_string()
}

fn split_cells(line: &str) -> Vec<String> {
    line.split(',').map(strip_quotes).collect()
}

/// A roster file split into header and positional data lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterTable {
    pub headers: Vec<String>,
    /// (1-based line number, cells)
    pub lines: Vec<(usize, Vec<String>)>,
}

/// Plain comma splitting: quoted commas and embedded newlines are not supported.
pub fn parse_roster_text(text: &str) -> Result<RosterTable, RosterError> {
    let mut it = text.split('\n').enumerate();
    let headers = match it.next() {
        Some((_, first)) if !first.trim().is_empty() => split_cells(first),
        _ => return Err(RosterError::Empty),
    };

    let mut lines = Vec::new();
    for (idx, raw) in it {
        if raw.trim().is_empty() {
            continue;
        }
        lines.push((idx + 1, split_cells(raw)));
    }
    Ok(RosterTable { headers, lines })
}

fn apply_field(row: &mut StudentRow, field: Field, value: &str) {
    let info = &mut row.info;
    match field {
        Field::Name => info.name = value.to_string(),
        Field::Roll => info.roll_number = value.to_string(),
        Field::PersonalEmail => info.personal_email = value.to_string(),
        Field::CollegeEmail => info.college_email = value.to_string(),
        Field::Phone => info.phone = value.to_string(),
        Field::Address => info.address = value.to_string(),
        Field::Section => info.branch = value.to_string(),
        Field::Year => info.year = value.to_string(),
        Field::IsRegistered => row.is_registered = Some(parse_flag(value)),
        Field::Present => row.present = Some(parse_flag(value)),
        Field::HasPaid => row.has_paid = Some(parse_flag(value)),
        Field::TransactionId => row.transaction_id = Some(value.to_string()),
        Field::PaymentQr => row.payment_qr = Some(value.to_string()),
        Field::JoinedGroup => row.joined_group = Some(parse_flag(value)),
        Field::DockerSkill => row.docker_skill = Some(value.to_string()),
        Field::HasUsedDocker => row.has_used_docker = Some(parse_flag(value)),
    }
}

/// Maps (header, value) pairs onto a row. Missing cells stay at their defaults.
pub fn map_row<'a>(line_no: usize, cells: impl IntoIterator<Item = (&'a str, &'a str)>) -> StudentRow {
    let mut row = StudentRow {
        line_no,
        ..StudentRow::default()
    };
    for (header, value) in cells {
        if let Some(field) = lookup_column(header) {
            apply_field(&mut row, field, value);
        }
    }
    row.info.is_hosteller = is_hosteller_address(&row.info.address);
    row
}

impl RosterTable {
    pub fn rows(&self) -> Vec<StudentRow> {
        self.lines
            .iter()
            .map(|(line_no, cells)| {
                map_row(
                    *line_no,
                    self.headers
                        .iter()
                        .enumerate()
                        .map(|(i, h)| (h.as_str(), cells.get(i).map(|s| s.as_str()).unwrap_or(""))),
                )
            })
            .collect()
    }

    pub fn ignored_columns(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter(|h| !h.is_empty() && lookup_column(h).is_none())
            .cloned()
            .collect()
    }
}

/// Rows supplied as loose key/value objects (IPC callers).
pub fn rows_from_objects(objects: &[BTreeMap<String, String>]) -> Vec<StudentRow> {
    objects
        .iter()
        .enumerate()
        .map(|(i, obj)| map_row(i + 1, obj.iter().map(|(k, v)| (k.as_str(), v.as_str()))))
        .collect()
}

pub fn check_extension(path: &Path) -> Result<(), RosterError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let name = path.to_string_lossy().to_string();
    match ext.as_str() {
        "csv" | "txt" => Ok(()),
        "xlsx" | "xls" => Err(RosterError::UnsupportedSpreadsheet(name)),
        _ => Err(RosterError::UnsupportedExtension(name)),
    }
}

pub fn read_roster_file(path: &Path) -> Result<String, RosterError> {
    check_extension(path)?;
    let bytes = std::fs::read(path).map_err(|source| RosterError::Io {
        path: path.to_string_lossy().to_string(),
        source,
    })?;
    // Zip (xlsx) and OLE (xls) signatures behind a .csv name.
    if bytes.starts_with(&[0x50, 0x4B, 0x03, 0x04])
        || bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0])
    {
        return Err(RosterError::UnsupportedSpreadsheet(
            path.to_string_lossy().to_string(),
        ));
    }
    // UTF-16 and binary content is rejected; other bytes decode lossily.
    if bytes.starts_with(&[0xFF, 0xFE]) || bytes.starts_with(&[0xFE, 0xFF]) || bytes.contains(&0) {
        return Err(RosterError::NotText);
    }
    let decoded = String::from_utf8_lossy(&bytes);
    let text: &str = &decoded;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text).to_string())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub rows: usize,
    pub ignored_columns: Vec<String>,
    #[serde(flatten)]
    pub batch: BatchReport,
    pub progress: Vec<u8>,
}

/// Reads, parses and writes a roster file. `progress` sees coarse percentages.
pub fn import_roster(
    conn: &Connection,
    path: &Path,
    batch_size: usize,
    progress: &mut dyn FnMut(u8),
) -> Result<ImportReport, RosterError> {
    let mut milestones: Vec<u8> = Vec::new();
    let mut report_progress = |p: u8| {
        milestones.push(p);
        progress(p);
    };

    let text = read_roster_file(path)?;
    report_progress(10);
    let table = parse_roster_text(&text)?;
    let rows = table.rows();
    report_progress(30);
    info!(
        path = %path.to_string_lossy(),
        rows = rows.len(),
        "roster parsed"
    );

    report_progress(70);
    let batch = directory::upsert_batch(conn, &rows, batch_size, &mut |done, total| {
        let pct = 70 + (done * 30 / total.max(1)).min(30);
        report_progress(pct as u8);
    });
    if batch.batches.is_empty() {
        report_progress(100);
    }

    Ok(ImportReport {
        rows: rows.len(),
        ignored_columns: table.ignored_columns(),
        batch,
        progress: milestones,
    })
}
