use crate::auth::{Capability, Identity};
use crate::calc::{self, AttendanceFilter, AttendanceTally, RiskInput};
use crate::error::{AppError, AppResult};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{get_optional_date, get_optional_str, get_required_str, run, Op};
use crate::ipc::types::{AppState, Request};
use crate::model::{EvasionStatus, GradeRow};
use chrono::{Duration, Local};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

fn tally_json(t: &AttendanceTally) -> Value {
    json!({
        "total": t.total,
        "present": t.present,
        "absent": t.absent,
        "justifiedAbsences": t.justified_absences,
        "rate": t.rate(),
        "percentage": t.percentage()
    })
}

fn stats_attendance(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    let scope = get_required_str(params, "scope")?;
    let mut filter = AttendanceFilter {
        date_from: get_optional_date(params, "dateFrom")?,
        date_to: get_optional_date(params, "dateTo")?,
        ..AttendanceFilter::default()
    };
    let id = match scope.as_str() {
        "global" => None,
        "student" | "class" | "subject" => Some(get_required_str(params, "id")?),
        _ => {
            return Err(AppError::bad_params(
                "scope must be one of: student, class, subject, global",
            ))
        }
    };
    match scope.as_str() {
        "student" => {
            let sid = id.clone().unwrap_or_default();
            who.require_can_view_student(&sid)?;
            filter.student_id = Some(sid);
        }
        other => {
            // Class, subject and school-wide figures include other students.
            who.require(Capability::ViewDirectory)?;
            match other {
                "class" => filter.class_id = id.clone(),
                "subject" => filter.subject_id = id.clone(),
                _ => {}
            }
        }
    }
    let rows = calc::load_attendance(conn, &filter)?;
    let tally = AttendanceTally::from_rows(&rows);
    let mut out = tally_json(&tally);
    out["scope"] = json!(scope);
    out["id"] = json!(id);
    Ok(out)
}

fn average_of(rows: &[&GradeRow]) -> Option<f64> {
    calc::grade_average(rows.iter().map(|r| (r.value, r.max_value))).map(calc::round_off_1_decimal)
}

fn stats_grades(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    let mut student_id = get_optional_str(params, "studentId")?;
    let subject_id = get_optional_str(params, "subjectId")?;
    match student_id.as_deref() {
        Some(s) => who.require_can_view_student(s)?,
        None if !who.role.is_staff() => student_id = Some(who.user_id.clone()),
        None => {}
    }
    let rows = calc::load_grades(conn, student_id.as_deref(), subject_id.as_deref())?;
    let all: Vec<&GradeRow> = rows.iter().collect();

    let mut by_subject: BTreeMap<&str, Vec<&GradeRow>> = BTreeMap::new();
    for r in &rows {
        by_subject.entry(r.subject_id.as_str()).or_default().push(r);
    }
    let subjects: Vec<Value> = by_subject
        .iter()
        .map(|(sid, rs)| json!({ "subjectId": sid, "count": rs.len(), "average": average_of(rs) }))
        .collect();

    Ok(json!({
        "studentId": student_id,
        "subjectId": subject_id,
        "count": rows.len(),
        "average": average_of(&all),
        "subjects": subjects
    }))
}

struct ActiveStudent {
    id: String,
    name: String,
    class_id: Option<String>,
}

fn active_students(conn: &Connection, class_id: Option<&str>) -> AppResult<Vec<ActiveStudent>> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.name, p.class_id
         FROM profiles p
         JOIN user_roles r ON r.user_id = p.id AND r.role = 'student'
         WHERE (?1 IS NULL OR p.class_id = ?1)
           AND NOT EXISTS(SELECT 1 FROM evasion_records e
                          WHERE e.student_id = p.id AND e.status = 'active')
         ORDER BY p.name, p.id",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok(ActiveStudent {
                id: r.get(0)?,
                name: r.get(1)?,
                class_id: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn stats_risk(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ViewDirectory)?;
    let class_id = get_optional_str(params, "classId")?;
    let thresholds = setup::risk_thresholds(conn)?;
    let cutoff = Local::now()
        .date_naive()
        .checked_sub_signed(Duration::days(thresholds.recent_evasion_days))
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();

    let students = active_students(conn, class_id.as_deref())?;

    let attendance = calc::load_attendance(
        conn,
        &AttendanceFilter {
            class_id: class_id.clone(),
            ..AttendanceFilter::default()
        },
    )?;
    let mut tallies: HashMap<&str, Vec<_>> = HashMap::new();
    for r in &attendance {
        tallies.entry(r.student_id.as_str()).or_default().push(r);
    }
    let grades = calc::load_grades(conn, None, None)?;
    let mut grade_map: HashMap<&str, Vec<(f64, f64)>> = HashMap::new();
    for g in &grades {
        grade_map
            .entry(g.student_id.as_str())
            .or_default()
            .push((g.value, g.max_value));
    }
    let mut recent: HashMap<String, usize> = HashMap::new();
    for e in calc::load_evasions(conn, None, Some(EvasionStatus::Cancelled))? {
        if e.date >= cutoff {
            *recent.entry(e.student_id).or_default() += 1;
        }
    }

    let mut assessed: Vec<(ActiveStudent, AttendanceTally, Option<f64>, usize, calc::RiskAssessment)> =
        Vec::with_capacity(students.len());
    for s in students {
        let tally = AttendanceTally::from_rows(
            tallies.get(s.id.as_str()).into_iter().flatten().copied(),
        );
        let avg = grade_map
            .get(s.id.as_str())
            .and_then(|g| calc::grade_average(g.iter().copied()));
        let evasions = recent.get(&s.id).copied().unwrap_or(0);
        let risk = calc::assess_risk(
            &RiskInput {
                attendance: tally,
                grade_average: avg,
                recent_evasions: evasions,
            },
            &thresholds,
        );
        assessed.push((s, tally, avg, evasions, risk));
    }
    assessed.sort_by(|a, b| calc::compare_risk(&a.4, &b.4).then_with(|| a.0.name.cmp(&b.0.name)));

    let out: Vec<Value> = assessed
        .into_iter()
        .map(|(s, tally, avg, evasions, risk)| {
            json!({
                "studentId": s.id,
                "name": s.name,
                "classId": s.class_id,
                "attendancePercentage": tally.percentage(),
                "attendanceRecords": tally.total,
                "gradeAverage": avg.map(calc::round_off_1_decimal),
                "recentEvasions": evasions,
                "riskLevel": risk.risk_level,
                "riskScore": risk.risk_score,
                "reasons": risk.reasons
            })
        })
        .collect();
    Ok(json!({ "students": out, "thresholds": thresholds }))
}

fn count(conn: &Connection, sql: &str) -> AppResult<i64> {
    Ok(conn.query_row(sql, [], |r| r.get(0))?)
}

fn dashboard_summary(conn: &Connection, who: &Identity, _params: &Value) -> AppResult<Value> {
    who.require(Capability::ViewDirectory)?;
    let classes = count(conn, "SELECT COUNT(*) FROM classes")?;
    let subjects = count(conn, "SELECT COUNT(*) FROM subjects")?;
    let evaded = count(
        conn,
        "SELECT COUNT(DISTINCT e.student_id)
         FROM evasion_records e
         JOIN user_roles r ON r.user_id = e.student_id AND r.role = 'student'
         WHERE e.status = 'active'",
    )?;
    let students = count(conn, "SELECT COUNT(*) FROM user_roles WHERE role = 'student'")?;
    let published = count(
        conn,
        "SELECT COUNT(*) FROM communications WHERE is_published = 1",
    )?;
    let global = AttendanceTally::from_rows(&calc::load_attendance(conn, &AttendanceFilter::default())?);

    let risk = stats_risk(conn, who, &json!({}))?;
    let mut by_level: BTreeMap<&str, usize> = BTreeMap::new();
    for key in ["critical", "warning", "normal"] {
        let n = risk["students"]
            .as_array()
            .map(|a| a.iter().filter(|s| s["riskLevel"] == key).count())
            .unwrap_or(0);
        by_level.insert(key, n);
    }

    Ok(json!({
        "classes": classes,
        "subjects": subjects,
        "activeStudents": students - evaded,
        "evadedStudents": evaded,
        "publishedCommunications": published,
        "attendance": tally_json(&global),
        "atRisk": by_level
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let op: Op = match req.method.as_str() {
        "stats.attendance" => stats_attendance,
        "stats.grades" => stats_grades,
        "stats.risk" => stats_risk,
        "dashboard.summary" => dashboard_summary,
        _ => return None,
    };
    Some(run(state, req, op))
}
