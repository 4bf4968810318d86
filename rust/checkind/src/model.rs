use serde::{Deserialize, Serialize};

/// Student profile as carried by a QR payload or a roster row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserInfo {
    pub name: String,
    pub roll_number: String,
    pub personal_email: String,
    pub college_email: String,
    pub phone: String,
    pub address: String,
    pub branch: String,
    pub year: String,
    pub is_hosteller: bool,
}

/// State owned by the directory rather than by the student's profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationalFlags {
    pub present: bool,
    pub has_paid: bool,
    pub transaction_id: String,
    pub payment_qr: String,
    pub joined_group: bool,
    pub docker_skill: String,
    pub has_used_docker: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    #[serde(flatten)]
    pub info: UserInfo,
    pub is_registered: bool,
    #[serde(flatten)]
    pub flags: OperationalFlags,
    pub updated_at: Option<String>,
}
