use crate::auth::{Capability, Identity, Role};
use crate::calc;
use crate::db::now_ts;
use crate::error::{is_unique_violation, AppError, AppResult};
use crate::ipc::helpers::{
    get_optional_str, get_required_date, get_required_f64, get_required_str, load_student,
    load_subject, new_id, parse_date, run, Op, SubjectRef,
};
use crate::ipc::types::{AppState, Request};
use crate::model::GradeRow;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

const TYPE_MAX_CHARS: usize = 50;

/// Role gate plus the instructor's own-subject rule.
fn require_grade_rights(who: &Identity, subject: &SubjectRef) -> AppResult<()> {
    who.require(Capability::RecordGrades)?;
    if who.role == Role::Instructor && subject.teacher_id.as_deref() != Some(who.user_id.as_str()) {
        return Err(AppError::Forbidden {
            role: who.role.as_str(),
            capability: Capability::RecordGrades,
        });
    }
    Ok(())
}

fn check_grade(kind: &str, value: f64, max_value: f64) -> AppResult<()> {
    if kind.chars().count() > TYPE_MAX_CHARS {
        return Err(AppError::bad_params(format!(
            "type length must be <= {}",
            TYPE_MAX_CHARS
        )));
    }
    if max_value <= 0.0 {
        return Err(AppError::bad_params("maxValue must be > 0"));
    }
    if !(0.0..=max_value).contains(&value) {
        return Err(AppError::bad_params("value must be in 0..=maxValue"));
    }
    Ok(())
}

fn grade_json(row: &GradeRow) -> Value {
    let mut v = json!(row);
    v["normalized"] = json!(calc::round_off_1_decimal(calc::normalize_grade(
        row.value,
        row.max_value
    )));
    v
}

fn duplicate_grade(row_student: &str, subject: &str, kind: &str, date: &str) -> AppError {
    AppError::duplicate(
        "grade already recorded for this student, subject, type and date",
        Some(json!({
            "studentId": row_student,
            "subjectId": subject,
            "type": kind,
            "date": date
        })),
    )
}

fn load_grade(conn: &Connection, id: &str) -> AppResult<GradeRow> {
    conn.query_row(
        &format!("SELECT {} FROM grade_records WHERE id = ?", GradeRow::COLUMNS),
        [id],
        GradeRow::from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("grade record", id))
}

fn grades_create(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::RecordGrades)?;
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let kind = get_required_str(params, "type")?;
    let date = get_required_date(params, "date")?;
    let value = get_required_f64(params, "value")?;
    let max_value = get_required_f64(params, "maxValue")?;
    check_grade(&kind, value, max_value)?;

    let subject = load_subject(conn, &subject_id)?;
    require_grade_rights(who, &subject)?;
    let student = load_student(conn, &student_id)?;
    if student.class_id.as_deref() != Some(subject.class_id.as_str()) {
        return Err(AppError::bad_params(
            "student is not enrolled in the subject's class",
        ));
    }

    let id = new_id();
    let inserted = conn.execute(
        "INSERT INTO grade_records(
            id, student_id, subject_id, type, date, value, max_value, teacher_id, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &student_id,
            &subject_id,
            &kind,
            &date,
            value,
            max_value,
            &who.user_id,
            now_ts(),
        ),
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(duplicate_grade(&student_id, &subject_id, &kind, &date))
        }
        Err(e) => return Err(AppError::write("grade_records")(e)),
    }
    tracing::info!(grade_id = %id, student_id = %student_id, subject_id = %subject_id, by = %who.user_id, "grade recorded");
    Ok(grade_json(&load_grade(conn, &id)?))
}

fn grades_update(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::RecordGrades)?;
    let id = get_required_str(params, "id")?;
    let Some(fields) = params.get("fields").and_then(|v| v.as_object()) else {
        return Err(AppError::bad_params("fields must be an object"));
    };
    let mut row = load_grade(conn, &id)?;
    let subject = load_subject(conn, &row.subject_id)?;
    require_grade_rights(who, &subject)?;

    let fields_value = Value::Object(fields.clone());
    for k in fields.keys() {
        match k.as_str() {
            "value" => row.value = get_required_f64(&fields_value, "value")?,
            "maxValue" => row.max_value = get_required_f64(&fields_value, "maxValue")?,
            "type" => row.kind = get_required_str(&fields_value, "type")?,
            "date" => row.date = parse_date(&get_required_str(&fields_value, "date")?, "date")?,
            other => {
                return Err(AppError::bad_params(format!(
                    "unknown grade field: {}",
                    other
                )))
            }
        }
    }
    if fields.is_empty() {
        return Err(AppError::bad_params("fields must not be empty"));
    }
    check_grade(&row.kind, row.value, row.max_value)?;

    let updated = conn.execute(
        "UPDATE grade_records
         SET value = ?, max_value = ?, type = ?, date = ?, updated_at = ?
         WHERE id = ?",
        (row.value, row.max_value, &row.kind, &row.date, now_ts(), &id),
    );
    match updated {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(duplicate_grade(&row.student_id, &row.subject_id, &row.kind, &row.date))
        }
        Err(e) => return Err(AppError::write("grade_records")(e)),
    }
    tracing::info!(grade_id = %id, by = %who.user_id, "grade updated");
    Ok(grade_json(&load_grade(conn, &id)?))
}

fn grades_list(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    let mut student_id = get_optional_str(params, "studentId")?;
    let subject_id = get_optional_str(params, "subjectId")?;
    match student_id.as_deref() {
        Some(s) => who.require_can_view_student(s)?,
        None if !who.role.is_staff() => student_id = Some(who.user_id.clone()),
        None => {}
    }
    let rows = calc::load_grades(conn, student_id.as_deref(), subject_id.as_deref())?;
    let average = calc::grade_average(rows.iter().map(|r| (r.value, r.max_value)))
        .map(calc::round_off_1_decimal);
    let grades: Vec<Value> = rows.iter().map(grade_json).collect();
    Ok(json!({ "grades": grades, "average": average }))
}

fn grades_delete(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::DeleteGrades)?;
    let id = get_required_str(params, "id")?;
    let changed = conn
        .execute("DELETE FROM grade_records WHERE id = ?", [&id])
        .map_err(AppError::write("grade_records"))?;
    if changed == 0 {
        return Err(AppError::not_found("grade record", id));
    }
    tracing::info!(grade_id = %id, by = %who.user_id, "grade deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let op: Op = match req.method.as_str() {
        "grades.create" => grades_create,
        "grades.update" => grades_update,
        "grades.list" => grades_list,
        "grades.delete" => grades_delete,
        _ => return None,
    };
    Some(run(state, req, op))
}
