use crate::auth::{Capability, Identity, Role};
use crate::calc;
use crate::db::{now_ts, write_tx};
use crate::error::{is_unique_violation, AppError, AppResult};
use crate::ipc::helpers::{
    get_optional_str, get_required_date, get_required_str, load_student, new_id, run, Op,
    StudentRef,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{EvasionRow, EvasionStatus};
use crate::notify;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

const REASON_MAX_CHARS: usize = 1000;

fn load_evasion(conn: &Connection, id: &str) -> AppResult<EvasionRow> {
    conn.query_row(
        &format!("SELECT {} FROM evasion_records WHERE id = ?", EvasionRow::COLUMNS),
        [id],
        EvasionRow::from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("evasion record", id))
}

fn active_evasion(conn: &Connection, student_id: &str) -> AppResult<Option<EvasionRow>> {
    Ok(calc::load_evasions(conn, Some(student_id), Some(EvasionStatus::Active))?
        .into_iter()
        .next())
}

/// What marking the student as evaded changes. Attendance and grades are kept.
fn evasion_impact(conn: &Connection, student: &StudentRef) -> AppResult<Value> {
    let class = match student.class_id.as_deref() {
        Some(cid) => conn
            .query_row(
                "SELECT id, name, year FROM classes WHERE id = ?",
                [cid],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "name": r.get::<_, String>(1)?,
                        "year": r.get::<_, i64>(2)?
                    }))
                },
            )
            .optional()?,
        None => None,
    };
    let mut stmt = conn.prepare("SELECT id, name FROM subjects WHERE class_id = ? ORDER BY name")?;
    let subjects = stmt
        .query_map([&student.class_id], |r| {
            Ok(json!({ "id": r.get::<_, String>(0)?, "name": r.get::<_, String>(1)? }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let (attendance, grades): (i64, i64) = conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM attendance_records WHERE student_id = ?1),
           (SELECT COUNT(*) FROM grade_records WHERE student_id = ?1)",
        [&student.id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(json!({
        "studentId": student.id,
        "studentName": student.name,
        "class": class,
        "rosterSubjects": subjects,
        "attendanceRecordsKept": attendance,
        "gradeRecordsKept": grades
    }))
}

fn evasion_create(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ManageEvasion)?;
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_date(params, "date")?;
    let reason = get_required_str(params, "reason")?;
    if reason.chars().count() > REASON_MAX_CHARS {
        return Err(AppError::bad_params(format!(
            "reason length must be <= {}",
            REASON_MAX_CHARS
        )));
    }
    let confirm = match params.get("confirm") {
        None | Some(Value::Null) => false,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| AppError::bad_params("confirm must be boolean"))?,
    };
    let student = load_student(conn, &student_id)?;

    if let Some(existing) = active_evasion(conn, &student_id)? {
        let status = calc::derive_student_status(std::slice::from_ref(&existing));
        return Ok(json!({ "alreadyEvaded": true, "evasion": existing, "status": status }));
    }
    if !confirm {
        return Ok(json!({
            "requiresConfirmation": true,
            "impact": evasion_impact(conn, &student)?
        }));
    }

    let id = new_id();
    let tx = write_tx(conn).map_err(AppError::Tx)?;
    let inserted = tx.execute(
        "INSERT INTO evasion_records(id, student_id, date, reason, status, reported_by, created_at)
         VALUES(?, ?, ?, ?, 'active', ?, ?)",
        (&id, &student_id, &date, &reason, &who.user_id, now_ts()),
    );
    match inserted {
        Ok(_) => tx.commit().map_err(AppError::Tx)?,
        // Another writer evaded the student first; report theirs.
        Err(e) if is_unique_violation(&e) => {
            drop(tx);
            if let Some(existing) = active_evasion(conn, &student_id)? {
                let status = calc::derive_student_status(std::slice::from_ref(&existing));
                return Ok(json!({ "alreadyEvaded": true, "evasion": existing, "status": status }));
            }
            return Err(AppError::write("evasion_records")(e));
        }
        Err(e) => return Err(AppError::write("evasion_records")(e)),
    }

    let row = load_evasion(conn, &id)?;
    tracing::info!(student_id = %student_id, evasion_id = %id, date = %date, by = %who.user_id, "student evaded");
    notify::notify_roles(
        conn,
        &[Role::Coordinator, Role::Tutor],
        notify::Kind::Evasion,
        "Student evasion recorded",
        &format!("{} was marked as evaded on {}", student.name, date),
    );
    Ok(json!({
        "alreadyEvaded": false,
        "evasion": row,
        "status": calc::student_status(conn, &student_id)?
    }))
}

fn evasion_cancel(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ManageEvasion)?;
    let evasion_id = get_required_str(params, "evasionId")?;
    let student_id = get_required_str(params, "studentId")?;

    let tx = write_tx(conn).map_err(AppError::Tx)?;
    let row = load_evasion(&tx, &evasion_id)?;
    if row.student_id != student_id {
        return Err(AppError::bad_params("evasion record belongs to another student"));
    }
    if row.status == EvasionStatus::Cancelled {
        drop(tx);
        return Ok(json!({
            "changed": false,
            "evasion": row,
            "status": calc::student_status(conn, &student_id)?
        }));
    }
    tx.execute(
        "UPDATE evasion_records
         SET status = 'cancelled', cancelled_at = ?, cancelled_by = ?
         WHERE id = ? AND status = 'active'",
        (now_ts(), &who.user_id, &evasion_id),
    )
    .map_err(AppError::write("evasion_records"))?;
    tx.commit().map_err(AppError::Tx)?;

    tracing::info!(student_id = %student_id, evasion_id = %evasion_id, by = %who.user_id, "evasion cancelled");
    Ok(json!({
        "changed": true,
        "evasion": load_evasion(conn, &evasion_id)?,
        "status": calc::student_status(conn, &student_id)?
    }))
}

fn evasion_list(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    let mut student_id = get_optional_str(params, "studentId")?;
    match student_id.as_deref() {
        Some(s) => who.require_can_view_student(s)?,
        None if !who.role.is_staff() => student_id = Some(who.user_id.clone()),
        None => {}
    }
    let status = match get_optional_str(params, "status")? {
        Some(s) => Some(
            EvasionStatus::parse(&s)
                .ok_or_else(|| AppError::bad_params("status must be active or cancelled"))?,
        ),
        None => None,
    };
    let rows = calc::load_evasions(conn, student_id.as_deref(), status)?;
    Ok(json!({ "evasions": rows }))
}

fn evasion_status(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    let student_id = get_required_str(params, "studentId")?;
    who.require_can_view_student(&student_id)?;
    let student = load_student(conn, &student_id)?;
    let status = calc::student_status(conn, &student.id)?;
    Ok(json!({
        "studentId": student.id,
        "status": status.label(),
        "detail": status
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let op: Op = match req.method.as_str() {
        "evasion.create" => evasion_create,
        "evasion.cancel" => evasion_cancel,
        "evasion.list" => evasion_list,
        "evasion.status" => evasion_status,
        _ => return None,
    };
    Some(run(state, req, op))
}
