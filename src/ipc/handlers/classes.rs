use crate::auth::{self, Capability, Identity, Role};
use crate::db::now_ts;
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, load_subject, new_id, require_class, run, Op,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

fn classes_list(conn: &Connection, _who: &Identity, _params: &Value) -> AppResult<Value> {
    // Correlated subqueries avoid double counting from joins.
    let mut stmt = conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.year,
           (SELECT COUNT(*) FROM profiles p
              JOIN user_roles r ON r.user_id = p.id AND r.role = 'student'
             WHERE p.class_id = c.id
               AND NOT EXISTS(SELECT 1 FROM evasion_records e
                              WHERE e.student_id = p.id AND e.status = 'active')) AS active_count,
           (SELECT COUNT(*) FROM profiles p
              JOIN user_roles r ON r.user_id = p.id AND r.role = 'student'
             WHERE p.class_id = c.id
               AND EXISTS(SELECT 1 FROM evasion_records e
                          WHERE e.student_id = p.id AND e.status = 'active')) AS evaded_count,
           (SELECT COUNT(*) FROM subjects s WHERE s.class_id = c.id) AS subject_count
         FROM classes c
         ORDER BY c.year DESC, c.name",
    )?;
    let classes = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "year": row.get::<_, i64>(2)?,
                "activeStudentCount": row.get::<_, i64>(3)?,
                "evadedStudentCount": row.get::<_, i64>(4)?,
                "subjectCount": row.get::<_, i64>(5)?
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": classes }))
}

fn classes_create(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ManageSchool)?;
    let name = get_required_str(params, "name")?;
    let year = params
        .get("year")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| AppError::bad_params("year must be integer"))?;
    if !(1900..=2200).contains(&year) {
        return Err(AppError::bad_params("year must be in 1900..=2200"));
    }

    let class_id = new_id();
    conn.execute(
        "INSERT INTO classes(id, name, year, created_at) VALUES(?, ?, ?, ?)",
        (&class_id, &name, year, now_ts()),
    )
    .map_err(AppError::write("classes"))?;
    tracing::info!(class_id = %class_id, by = %who.user_id, "class created");
    Ok(json!({ "classId": class_id, "name": name, "year": year }))
}

fn classes_delete(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ManageSchool)?;
    let class_id = get_required_str(params, "classId")?;
    require_class(conn, &class_id)?;

    // No ON DELETE CASCADE: a class with history must be emptied explicitly.
    let (students, subjects, attendance): (i64, i64, i64) = conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM profiles WHERE class_id = ?1),
           (SELECT COUNT(*) FROM subjects WHERE class_id = ?1),
           (SELECT COUNT(*) FROM attendance_records WHERE class_id = ?1)",
        [&class_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    if students + subjects + attendance > 0 {
        return Err(AppError::Conflict(format!(
            "class still has {} student(s), {} subject(s) and {} attendance record(s)",
            students, subjects, attendance
        )));
    }
    conn.execute("DELETE FROM classes WHERE id = ?", [&class_id])
        .map_err(AppError::write("classes"))?;
    tracing::info!(class_id = %class_id, by = %who.user_id, "class deleted");
    Ok(json!({ "ok": true }))
}

/// Active roster: enrolled students without an active evasion.
pub fn active_roster(conn: &Connection, class_id: &str) -> AppResult<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.name
         FROM profiles p
         JOIN user_roles r ON r.user_id = p.id AND r.role = 'student'
         WHERE p.class_id = ?
           AND NOT EXISTS(SELECT 1 FROM evasion_records e
                          WHERE e.student_id = p.id AND e.status = 'active')
         ORDER BY p.name, p.id",
    )?;
    let rows = stmt
        .query_map([class_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn classes_roster(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ViewDirectory)?;
    let class_id = get_required_str(params, "classId")?;
    require_class(conn, &class_id)?;
    let students: Vec<Value> = active_roster(conn, &class_id)?
        .into_iter()
        .map(|(id, name)| json!({ "id": id, "name": name }))
        .collect();
    Ok(json!({ "classId": class_id, "students": students }))
}

fn require_instructor(conn: &Connection, teacher_id: &str) -> AppResult<()> {
    match auth::role_of(conn, teacher_id)? {
        Some(Role::Instructor) => Ok(()),
        Some(other) => Err(AppError::bad_params(format!(
            "teacher must have the instructor role, {} has {}",
            teacher_id, other
        ))),
        None => Err(AppError::not_found("profile", teacher_id)),
    }
}

fn subjects_create(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ManageSchool)?;
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?;
    let teacher_id = get_optional_str(params, "teacherId")?;
    require_class(conn, &class_id)?;
    if let Some(t) = teacher_id.as_deref() {
        require_instructor(conn, t)?;
    }

    let taken = conn
        .query_row(
            "SELECT 1 FROM subjects WHERE class_id = ? AND name = ?",
            (&class_id, &name),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if taken {
        return Err(AppError::duplicate(
            "subject name already used in this class",
            Some(json!({ "classId": class_id, "name": name })),
        ));
    }

    let subject_id = new_id();
    conn.execute(
        "INSERT INTO subjects(id, class_id, name, teacher_id) VALUES(?, ?, ?, ?)",
        (&subject_id, &class_id, &name, &teacher_id),
    )
    .map_err(AppError::write("subjects"))?;
    Ok(json!({
        "subjectId": subject_id,
        "classId": class_id,
        "name": name,
        "teacherId": teacher_id
    }))
}

fn subjects_list(conn: &Connection, _who: &Identity, params: &Value) -> AppResult<Value> {
    let class_id = get_optional_str(params, "classId")?;
    let mut stmt = conn.prepare(
        "SELECT s.id, s.class_id, s.name, s.teacher_id, p.name
         FROM subjects s
         LEFT JOIN profiles p ON p.id = s.teacher_id
         WHERE (?1 IS NULL OR s.class_id = ?1)
         ORDER BY s.class_id, s.name",
    )?;
    let subjects = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classId": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "teacherId": r.get::<_, Option<String>>(3)?,
                "teacherName": r.get::<_, Option<String>>(4)?
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_assign_instructor(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ManageSchool)?;
    let subject_id = get_required_str(params, "subjectId")?;
    let teacher_id = get_optional_str(params, "teacherId")?;
    let subject = load_subject(conn, &subject_id)?;
    if let Some(t) = teacher_id.as_deref() {
        require_instructor(conn, t)?;
    }
    conn.execute(
        "UPDATE subjects SET teacher_id = ? WHERE id = ?",
        (&teacher_id, &subject.id),
    )
    .map_err(AppError::write("subjects"))?;
    tracing::info!(subject_id = %subject.id, teacher_id = ?teacher_id, by = %who.user_id, "instructor assigned");
    Ok(json!({ "subjectId": subject.id, "teacherId": teacher_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let op: Op = match req.method.as_str() {
        "classes.list" => classes_list,
        "classes.create" => classes_create,
        "classes.delete" => classes_delete,
        "classes.roster" => classes_roster,
        "subjects.create" => subjects_create,
        "subjects.list" => subjects_list,
        "subjects.assignInstructor" => subjects_assign_instructor,
        _ => return None,
    };
    Some(run(state, req, op))
}
