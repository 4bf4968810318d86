use crate::model::UserInfo;
use thiserror::Error;

pub const FIELD_SEPARATOR: &str = " | ";
pub const FIELD_COUNT: usize = 9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QrFormatError {
    #[error("invalid QR code format: expected 9 fields, found {found}")]
    TooFewFields { found: usize },
}

/// Positional split of a check-in payload. The separator is not escapable, so a
/// value containing `" | "` shifts every later field.
pub fn parse_qr_payload(data: &str) -> Result<UserInfo, QrFormatError> {
    let parts: Vec<&str> = data.split(FIELD_SEPARATOR).collect();
    if parts.len() < FIELD_COUNT {
        return Err(QrFormatError::TooFewFields { found: parts.len() });
    }

    Ok(UserInfo {
        name: parts[0].to_string(),
        roll_number: parts[1].to_string(),
        personal_email: parts[2].to_string(),
        college_email: parts[3].to_string(),
        phone: parts[4].to_string(),
        address: parts[5].to_string(),
        branch: parts[6].to_string(),
        year: parts[7].to_string(),
        is_hosteller: parts[8] == "true",
    })
}
