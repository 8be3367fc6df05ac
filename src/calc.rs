use crate::error::AppResult;
use crate::model::{AttendanceRow, EvasionRow, EvasionStatus, GradeRow};
use rusqlite::{params_from_iter, types::Value, Connection};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// `Int(10*x + 0.5) / 10`, used for every percentage and score we report.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// present / total, 0 for an empty scope.
pub fn attendance_rate(present: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        present as f64 / total as f64
    }
}

/// Grade on the 0-10 scale. A non-positive max normalizes to 0.
pub fn normalize_grade(value: f64, max_value: f64) -> f64 {
    if max_value > 0.0 {
        value / max_value * 10.0
    } else {
        0.0
    }
}

/// Mean of the normalized grades, `None` when there are none.
pub fn grade_average<I>(grades: I) -> Option<f64>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut sum = 0.0;
    let mut count = 0usize;
    for (value, max_value) in grades {
        sum += normalize_grade(value, max_value);
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceTally {
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub justified_absences: usize,
}

impl AttendanceTally {
    pub fn from_rows<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = &'a AttendanceRow>,
    {
        let mut t = AttendanceTally::default();
        for r in rows {
            t.total += 1;
            if r.is_present {
                t.present += 1;
            } else {
                t.absent += 1;
                if r.justification.as_deref().is_some_and(|j| !j.trim().is_empty()) {
                    t.justified_absences += 1;
                }
            }
        }
        t
    }

    pub fn rate(&self) -> f64 {
        attendance_rate(self.present, self.total)
    }

    pub fn percentage(&self) -> f64 {
        round_off_1_decimal(100.0 * self.rate())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollCallSummary {
    pub date: String,
    pub subject_id: String,
    pub class_id: String,
    pub batch_ids: Vec<String>,
    pub total_students: usize,
    pub present_count: usize,
    pub absent_count: usize,
    pub records: Vec<AttendanceRow>,
}

/// Folds raw rows into one summary per (date, subject, class), newest date first.
pub fn group_roll_calls(rows: Vec<AttendanceRow>) -> Vec<RollCallSummary> {
    let mut groups: BTreeMap<(String, String, String), Vec<AttendanceRow>> = BTreeMap::new();
    for r in rows {
        groups
            .entry((r.date.clone(), r.subject_id.clone(), r.class_id.clone()))
            .or_default()
            .push(r);
    }

    let mut out: Vec<RollCallSummary> = groups
        .into_iter()
        .map(|((date, subject_id, class_id), records)| {
            let tally = AttendanceTally::from_rows(&records);
            let mut batch_ids: Vec<String> = records.iter().map(|r| r.batch_id.clone()).collect();
            batch_ids.sort();
            batch_ids.dedup();
            RollCallSummary {
                date,
                subject_id,
                class_id,
                batch_ids,
                total_students: tally.total,
                present_count: tally.present,
                absent_count: tally.absent,
                records,
            }
        })
        .collect();
    out.sort_by(|a, b| {
        b.date
            .cmp(&a.date)
            .then_with(|| a.subject_id.cmp(&b.subject_id))
            .then_with(|| a.class_id.cmp(&b.class_id))
    });
    out
}

/// Derived student status. Never stored: a student is evaded iff an active
/// evasion record exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum StudentStatus {
    Active,
    #[serde(rename_all = "camelCase")]
    Evaded {
        evasion_id: String,
        reason: String,
        since: String,
    },
}

impl StudentStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, StudentStatus::Active)
    }

    pub fn label(&self) -> &'static str {
        match self {
            StudentStatus::Active => "active",
            StudentStatus::Evaded { .. } => "inactive",
        }
    }
}

pub fn derive_student_status<'a, I>(records: I) -> StudentStatus
where
    I: IntoIterator<Item = &'a EvasionRow>,
{
    // The store allows one active row per student; if history ever held more,
    // the most recent one wins.
    records
        .into_iter()
        .filter(|r| r.status == EvasionStatus::Active)
        .max_by(|a, b| a.date.cmp(&b.date).then_with(|| a.created_at.cmp(&b.created_at)))
        .map(|r| StudentStatus::Evaded {
            evasion_id: r.id.clone(),
            reason: r.reason.clone(),
            since: r.date.clone(),
        })
        .unwrap_or(StudentStatus::Active)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Normal,
    Warning,
    Critical,
}

/// Risk policy. Stored as the `risk` setup section; every field is a named knob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RiskThresholds {
    pub critical_attendance_percent: f64,
    pub warning_attendance_percent: f64,
    pub critical_grade_average: f64,
    pub warning_grade_average: f64,
    pub critical_score: f64,
    pub warning_score: f64,
    pub attendance_weight: f64,
    pub grade_weight: f64,
    pub evasion_weight: f64,
    pub recent_evasion_days: i64,
    pub min_records_for_attendance: usize,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            critical_attendance_percent: 60.0,
            warning_attendance_percent: 75.0,
            critical_grade_average: 4.0,
            warning_grade_average: 6.0,
            critical_score: 60.0,
            warning_score: 30.0,
            attendance_weight: 50.0,
            grade_weight: 40.0,
            evasion_weight: 10.0,
            recent_evasion_days: 90,
            min_records_for_attendance: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskInput {
    pub attendance: AttendanceTally,
    pub grade_average: Option<f64>,
    pub recent_evasions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub reasons: Vec<&'static str>,
}

pub fn assess_risk(input: &RiskInput, t: &RiskThresholds) -> RiskAssessment {
    let mut reasons: Vec<&'static str> = Vec::new();
    let mut level = RiskLevel::Normal;
    let mut raise = |to: RiskLevel, reason: &'static str, level: &mut RiskLevel| {
        reasons.push(reason);
        if to > *level {
            *level = to;
        }
    };

    let attendance_counts = input.attendance.total >= t.min_records_for_attendance.max(1);
    let attendance_pct = 100.0 * input.attendance.rate();

    let mut score = 0.0;
    if attendance_counts {
        score += (1.0 - input.attendance.rate()) * t.attendance_weight;
        if attendance_pct < t.critical_attendance_percent {
            raise(RiskLevel::Critical, "attendance_critical", &mut level);
        } else if attendance_pct < t.warning_attendance_percent {
            raise(RiskLevel::Warning, "attendance_low", &mut level);
        }
    }
    if let Some(avg) = input.grade_average {
        score += ((10.0 - avg) / 10.0).clamp(0.0, 1.0) * t.grade_weight;
        if avg < t.critical_grade_average {
            raise(RiskLevel::Critical, "grades_critical", &mut level);
        } else if avg < t.warning_grade_average {
            raise(RiskLevel::Warning, "grades_low", &mut level);
        }
    }
    if input.recent_evasions > 0 {
        score += input.recent_evasions as f64 * t.evasion_weight;
        raise(RiskLevel::Warning, "recent_evasion", &mut level);
    }

    let score = round_off_1_decimal(score.clamp(0.0, 100.0));
    if score >= t.critical_score {
        raise(RiskLevel::Critical, "score_critical", &mut level);
    } else if score >= t.warning_score {
        raise(RiskLevel::Warning, "score_warning", &mut level);
    }

    RiskAssessment {
        risk_level: level,
        risk_score: score,
        reasons,
    }
}

/// Sort key for at-risk listings: highest level, then highest score.
pub fn compare_risk(a: &RiskAssessment, b: &RiskAssessment) -> Ordering {
    b.risk_level.cmp(&a.risk_level).then_with(|| {
        b.risk_score
            .partial_cmp(&a.risk_score)
            .unwrap_or(Ordering::Equal)
    })
}

#[derive(Debug, Clone, Default)]
pub struct AttendanceFilter {
    pub class_id: Option<String>,
    pub subject_id: Option<String>,
    pub student_id: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

pub fn load_attendance(conn: &Connection, f: &AttendanceFilter) -> AppResult<Vec<AttendanceRow>> {
    let mut sql = format!(
        "SELECT {} FROM attendance_records WHERE 1 = 1",
        AttendanceRow::COLUMNS
    );
    let mut binds: Vec<Value> = Vec::new();
    for (col, op, v) in [
        ("class_id", "=", &f.class_id),
        ("subject_id", "=", &f.subject_id),
        ("student_id", "=", &f.student_id),
        ("date", ">=", &f.date_from),
        ("date", "<=", &f.date_to),
    ] {
        if let Some(v) = v {
            sql.push_str(&format!(" AND {} {} ?", col, op));
            binds.push(Value::Text(v.clone()));
        }
    }
    sql.push_str(" ORDER BY date, subject_id, class_id, student_id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), AttendanceRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_grades(
    conn: &Connection,
    student_id: Option<&str>,
    subject_id: Option<&str>,
) -> AppResult<Vec<GradeRow>> {
    let mut sql = format!("SELECT {} FROM grade_records WHERE 1 = 1", GradeRow::COLUMNS);
    let mut binds: Vec<Value> = Vec::new();
    if let Some(v) = student_id {
        sql.push_str(" AND student_id = ?");
        binds.push(Value::Text(v.to_string()));
    }
    if let Some(v) = subject_id {
        sql.push_str(" AND subject_id = ?");
        binds.push(Value::Text(v.to_string()));
    }
    sql.push_str(" ORDER BY date, subject_id, type");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), GradeRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_evasions(
    conn: &Connection,
    student_id: Option<&str>,
    status: Option<EvasionStatus>,
) -> AppResult<Vec<EvasionRow>> {
    let mut sql = format!("SELECT {} FROM evasion_records WHERE 1 = 1", EvasionRow::COLUMNS);
    let mut binds: Vec<Value> = Vec::new();
    if let Some(v) = student_id {
        sql.push_str(" AND student_id = ?");
        binds.push(Value::Text(v.to_string()));
    }
    if let Some(s) = status {
        sql.push_str(" AND status = ?");
        binds.push(Value::Text(s.as_str().to_string()));
    }
    sql.push_str(" ORDER BY date DESC, created_at DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), EvasionRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn student_status(conn: &Connection, student_id: &str) -> AppResult<StudentStatus> {
    let active = load_evasions(conn, Some(student_id), Some(EvasionStatus::Active))?;
    Ok(derive_student_status(&active))
}
