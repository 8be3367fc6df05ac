use rusqlite::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRow {
    pub id: String,
    pub batch_id: String,
    pub student_id: String,
    pub subject_id: String,
    pub class_id: String,
    pub date: String,
    pub is_present: bool,
    pub justification: Option<String>,
    pub recorded_by: String,
}

impl AttendanceRow {
    pub const COLUMNS: &'static str =
        "id, batch_id, student_id, subject_id, class_id, date, is_present, justification, recorded_by";

    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            batch_id: r.get(1)?,
            student_id: r.get(2)?,
            subject_id: r.get(3)?,
            class_id: r.get(4)?,
            date: r.get(5)?,
            is_present: r.get::<_, i64>(6)? != 0,
            justification: r.get(7)?,
            recorded_by: r.get(8)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRow {
    pub id: String,
    pub student_id: String,
    pub subject_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub date: String,
    pub value: f64,
    pub max_value: f64,
    pub teacher_id: String,
}

impl GradeRow {
    pub const COLUMNS: &'static str =
        "id, student_id, subject_id, type, date, value, max_value, teacher_id";

    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            student_id: r.get(1)?,
            subject_id: r.get(2)?,
            kind: r.get(3)?,
            date: r.get(4)?,
            value: r.get(5)?,
            max_value: r.get(6)?,
            teacher_id: r.get(7)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvasionStatus {
    Active,
    Cancelled,
}

impl EvasionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EvasionStatus::Active => "active",
            EvasionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(EvasionStatus::Active),
            "cancelled" => Some(EvasionStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvasionRow {
    pub id: String,
    pub student_id: String,
    pub date: String,
    pub reason: String,
    pub status: EvasionStatus,
    pub reported_by: String,
    pub created_at: String,
    pub cancelled_at: Option<String>,
    pub cancelled_by: Option<String>,
}

impl EvasionRow {
    pub const COLUMNS: &'static str =
        "id, student_id, date, reason, status, reported_by, created_at, cancelled_at, cancelled_by";

    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        let status_raw: String = r.get(4)?;
        let status = EvasionStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown evasion status {status_raw}").into(),
            )
        })?;
        Ok(Self {
            id: r.get(0)?,
            student_id: r.get(1)?,
            date: r.get(2)?,
            reason: r.get(3)?,
            status,
            reported_by: r.get(5)?,
            created_at: r.get(6)?,
            cancelled_at: r.get(7)?,
            cancelled_by: r.get(8)?,
        })
    }
}
