use crate::model::{OperationalFlags, StudentRecord, UserInfo};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 50;

const SELECT_STUDENT: &str = "SELECT roll, name, personal_email, college_email, phone, address,
        section, year, is_hosteller, is_registered, present, has_paid, transaction_id,
        payment_qr, joined_group, docker_skill, has_used_docker, updated_at
     FROM students
     WHERE roll = ?";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("student directory is unreachable: {0}")]
    Unreachable(String),
    #[error("student lookup failed: {0}")]
    Query(String),
    #[error("student write rejected: {0}")]
    Write(String),
    #[error("missing roll number")]
    MissingRoll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(StudentRecord),
    NotFound,
    QueryFailed(String),
}

/// One row headed for a batch upsert. `None` flags keep whatever is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudentRow {
    pub line_no: usize,
    pub info: UserInfo,
    pub is_registered: Option<bool>,
    pub present: Option<bool>,
    pub has_paid: Option<bool>,
    pub transaction_id: Option<String>,
    pub payment_qr: Option<String>,
    pub joined_group: Option<bool>,
    pub docker_skill: Option<String>,
    pub has_used_docker: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub created: bool,
    pub record: StudentRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub index: usize,
    pub first_line: usize,
    pub last_line: usize,
    pub rows: usize,
    pub affected: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub batches: Vec<BatchSummary>,
}

fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn record_from_row(r: &Row<'_>) -> rusqlite::Result<StudentRecord> {
    Ok(StudentRecord {
        info: UserInfo {
            roll_number: r.get(0)?,
            name: r.get(1)?,
            personal_email: r.get(2)?,
            college_email: r.get(3)?,
            phone: r.get(4)?,
            address: r.get(5)?,
            branch: r.get(6)?,
            year: r.get(7)?,
            is_hosteller: r.get::<_, i64>(8)? != 0,
        },
        is_registered: r.get::<_, i64>(9)? != 0,
        flags: OperationalFlags {
            present: r.get::<_, i64>(10)? != 0,
            has_paid: r.get::<_, i64>(11)? != 0,
            transaction_id: r.get(12)?,
            payment_qr: r.get(13)?,
            joined_group: r.get::<_, i64>(14)? != 0,
            docker_skill: r.get(15)?,
            has_used_docker: r.get::<_, i64>(16)? != 0,
        },
        updated_at: r.get(17)?,
    })
}

/// Cheap round trip proving the students table is reachable.
pub fn probe(conn: &Connection) -> Result<(), DirectoryError> {
    conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get::<_, i64>(0))
        .map(|_| ())
        .map_err(|e| DirectoryError::Unreachable(e.to_string()))
}

pub fn get_student(conn: &Connection, roll: &str) -> Result<Option<StudentRecord>, DirectoryError> {
    conn.query_row(SELECT_STUDENT, [roll], record_from_row)
        .optional()
        .map_err(|e| DirectoryError::Query(e.to_string()))
}

pub fn check_exists(conn: &Connection, roll: &str) -> Lookup {
    let roll = roll.trim();
    if roll.is_empty() {
        return Lookup::NotFound;
    }
    match get_student(conn, roll) {
        Ok(Some(record)) => Lookup::Found(record),
        Ok(None) => {
            debug!(roll, "student not found");
            Lookup::NotFound
        }
        Err(e) => {
            warn!(roll, error = %e, "student lookup failed");
            Lookup::QueryFailed(e.to_string())
        }
    }
}

/// Sets `present`; repeating the call leaves the row unchanged apart from `updated_at`.
/// Returns how many rows matched the roll number.
pub fn mark_present(conn: &Connection, roll: &str) -> Result<usize, DirectoryError> {
    let roll = roll.trim();
    if roll.is_empty() {
        return Err(DirectoryError::MissingRoll);
    }
    let matched = conn
        .execute(
            "UPDATE students SET present = 1, updated_at = ? WHERE roll = ?",
            (now_stamp(), roll),
        )
        .map_err(|e| DirectoryError::Write(e.to_string()))?;
    info!(roll, matched, "marked present");
    Ok(matched)
}

/// Saves a scanned profile. Operational flags on an existing row are carried over
/// untouched; only the profile columns change.
pub fn upsert_one(conn: &Connection, user: &UserInfo) -> Result<UpsertOutcome, DirectoryError> {
    let roll = user.roll_number.trim();
    if roll.is_empty() {
        return Err(DirectoryError::MissingRoll);
    }
    probe(conn)?;

    let existing = get_student(conn, roll)?;
    let created = existing.is_none();
    let flags = existing.map(|r| r.flags).unwrap_or_default();

    conn.execute(
        "INSERT INTO students(roll, name, personal_email, college_email, phone, address,
            section, year, is_hosteller, is_registered, present, has_paid, transaction_id,
            payment_qr, joined_group, docker_skill, has_used_docker, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
         ON CONFLICT(roll) DO UPDATE SET
           name = excluded.name,
           personal_email = excluded.personal_email,
           college_email = excluded.college_email,
           phone = excluded.phone,
           address = excluded.address,
           section = excluded.section,
           year = excluded.year,
           is_hosteller = excluded.is_hosteller,
           is_registered = 1,
           present = excluded.present,
           has_paid = excluded.has_paid,
           transaction_id = excluded.transaction_id,
           payment_qr = excluded.payment_qr,
           joined_group = excluded.joined_group,
           docker_skill = excluded.docker_skill,
           has_used_docker = excluded.has_used_docker,
           updated_at = excluded.updated_at",
        params![
            roll,
            user.name,
            user.personal_email,
            user.college_email,
            user.phone,
            user.address,
            user.branch,
            user.year,
            user.is_hosteller,
            flags.present,
            flags.has_paid,
            flags.transaction_id,
            flags.payment_qr,
            flags.joined_group,
            flags.docker_skill,
            flags.has_used_docker,
            now_stamp(),
        ],
    )
    .map_err(|e| DirectoryError::Write(e.to_string()))?;

    let record = get_student(conn, roll)?
        .ok_or_else(|| DirectoryError::Write(format!("row {} missing after upsert", roll)))?;
    info!(roll, created, "student saved");
    Ok(UpsertOutcome { created, record })
}

fn write_row(conn: &Connection, row: &StudentRow, stamp: &str) -> rusqlite::Result<usize> {
    let info = &row.info;
    conn.execute(
        "INSERT INTO students(roll, name, personal_email, college_email, phone, address,
            section, year, is_hosteller, is_registered, present, has_paid, transaction_id,
            payment_qr, joined_group, docker_skill, has_used_docker, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
            COALESCE(?10, 0), COALESCE(?11, 0), COALESCE(?12, 0), COALESCE(?13, ''),
            COALESCE(?14, ''), COALESCE(?15, 0), COALESCE(?16, ''), COALESCE(?17, 0), ?18)
         ON CONFLICT(roll) DO UPDATE SET
           name = excluded.name,
           personal_email = excluded.personal_email,
           college_email = excluded.college_email,
           phone = excluded.phone,
           address = excluded.address,
           section = excluded.section,
           year = excluded.year,
           is_hosteller = excluded.is_hosteller,
           is_registered = COALESCE(?10, students.is_registered),
           present = COALESCE(?11, students.present),
           has_paid = COALESCE(?12, students.has_paid),
           transaction_id = COALESCE(?13, students.transaction_id),
           payment_qr = COALESCE(?14, students.payment_qr),
           joined_group = COALESCE(?15, students.joined_group),
           docker_skill = COALESCE(?16, students.docker_skill),
           has_used_docker = COALESCE(?17, students.has_used_docker),
           updated_at = excluded.updated_at",
        params![
            info.roll_number.trim(),
            info.name,
            info.personal_email,
            info.college_email,
            info.phone,
            info.address,
            info.branch,
            info.year,
            info.is_hosteller,
            row.is_registered,
            row.present,
            row.has_paid,
            row.transaction_id,
            row.payment_qr,
            row.joined_group,
            row.docker_skill,
            row.has_used_docker,
            stamp,
        ],
    )
}

fn write_chunk(conn: &Connection, chunk: &[&StudentRow], stamp: &str) -> rusqlite::Result<usize> {
    let mut affected = 0usize;
    for row in chunk {
        affected += write_row(conn, row, stamp)?;
    }
    Ok(affected)
}

/// Writes rows in fixed-size batches, one transaction each. A failing batch is
/// rolled back and counted as failed in full; later batches still run.
/// `progress` receives (rows handled, total rows) after every batch.
pub fn upsert_batch(
    conn: &Connection,
    rows: &[StudentRow],
    batch_size: usize,
    progress: &mut dyn FnMut(usize, usize),
) -> BatchReport {
    let mut report = BatchReport::default();
    let total = rows.len();
    let stamp = now_stamp();

    let mut valid: Vec<&StudentRow> = Vec::with_capacity(rows.len());
    for row in rows {
        if row.info.roll_number.trim().is_empty() {
            report.failed += 1;
            report
                .errors
                .push(format!("Line {}: missing roll number", row.line_no));
        } else {
            valid.push(row);
        }
    }

    let mut handled = report.failed;
    for (index, chunk) in valid.chunks(batch_size.max(1)).enumerate() {
        let mut summary = BatchSummary {
            index: index + 1,
            first_line: chunk.first().map(|r| r.line_no).unwrap_or(0),
            last_line: chunk.last().map(|r| r.line_no).unwrap_or(0),
            rows: chunk.len(),
            ..BatchSummary::default()
        };

        let result = conn.unchecked_transaction().and_then(|tx| {
            let affected = write_chunk(&tx, chunk, &stamp)?;
            tx.commit()?;
            Ok(affected)
        });
        match result {
            Ok(affected) => {
                report.success += affected;
                summary.affected = affected;
            }
            Err(e) => {
                warn!(batch = index + 1, error = %e, "batch upsert failed");
                report.failed += chunk.len();
                let msg = format!("Batch {}: {}", index + 1, e);
                report.errors.push(msg.clone());
                summary.error = Some(msg);
            }
        }
        report.batches.push(summary);

        handled += chunk.len();
        progress(handled, total);
    }

    info!(
        success = report.success,
        failed = report.failed,
        batches = report.batches.len(),
        "batch upsert finished"
    );
    report
}
