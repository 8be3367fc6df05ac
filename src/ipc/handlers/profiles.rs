use crate::auth::{self, Capability, Identity, Role};
use crate::calc;
use crate::db::{now_ts, write_tx};
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, load_student, require_class, respond, run, Op,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::{json, Value};

/// Self-registration after the auth provider has issued `userId`. The first
/// profile in a workspace becomes admin; everyone else starts as student.
fn profiles_register(conn: &Connection, params: &Value) -> AppResult<Value> {
    let user_id = get_required_str(params, "userId")?;
    let name = get_required_str(params, "name")?;
    let email = get_optional_str(params, "email")?;
    if name.chars().count() > 200 {
        return Err(AppError::bad_params("name length must be <= 200"));
    }

    let tx = write_tx(conn).map_err(AppError::Tx)?;
    let exists = tx
        .query_row("SELECT 1 FROM profiles WHERE id = ?", [&user_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some();
    if exists {
        return Err(AppError::duplicate(
            "profile already registered",
            Some(json!({ "userId": user_id })),
        ));
    }
    let role = if auth::admin_count(&tx)? == 0 {
        Role::Admin
    } else {
        Role::Student
    };
    let now = now_ts();
    tx.execute(
        "INSERT INTO profiles(id, name, email, class_id, created_at) VALUES(?, ?, ?, NULL, ?)",
        (&user_id, &name, &email, &now),
    )
    .map_err(AppError::write("profiles"))?;
    tx.execute(
        "INSERT INTO user_roles(user_id, role, assigned_by, assigned_at) VALUES(?, ?, NULL, ?)",
        (&user_id, role.as_str(), &now),
    )
    .map_err(AppError::write("user_roles"))?;
    tx.commit().map_err(AppError::Tx)?;

    tracing::info!(user_id = %user_id, role = %role, "profile registered");
    Ok(json!({ "userId": user_id, "name": name, "role": role }))
}

fn profile_json(
    id: String,
    name: String,
    email: Option<String>,
    class_id: Option<String>,
    role: Option<String>,
    evaded: bool,
) -> Value {
    let is_student = role.as_deref() == Some("student");
    json!({
        "id": id,
        "name": name,
        "email": email,
        "classId": class_id,
        "role": role,
        "status": if is_student && evaded { "inactive" } else { "active" },
    })
}

fn profiles_list(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ViewDirectory)?;
    let role_filter = match get_optional_str(params, "role")? {
        Some(r) => Some(
            Role::parse(&r).ok_or_else(|| AppError::bad_params(format!("unknown role: {}", r)))?,
        ),
        None => None,
    };
    let class_filter = get_optional_str(params, "classId")?;

    let mut sql = String::from(
        "SELECT p.id, p.name, p.email, p.class_id, r.role,
                EXISTS(SELECT 1 FROM evasion_records e
                       WHERE e.student_id = p.id AND e.status = 'active') AS evaded
         FROM profiles p
         LEFT JOIN user_roles r ON r.user_id = p.id
         WHERE 1 = 1",
    );
    let mut binds: Vec<SqlValue> = Vec::new();
    if let Some(r) = role_filter {
        sql.push_str(" AND r.role = ?");
        binds.push(SqlValue::Text(r.as_str().to_string()));
    }
    if let Some(c) = class_filter {
        sql.push_str(" AND p.class_id = ?");
        binds.push(SqlValue::Text(c));
    }
    sql.push_str(" ORDER BY p.name, p.id");

    let mut stmt = conn.prepare(&sql)?;
    let profiles = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(profile_json(
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get::<_, i64>(5)? != 0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "profiles": profiles }))
}

fn profiles_get(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    let id = get_required_str(params, "id")?;
    who.require_can_view_student(&id)?;
    let row: Option<(String, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT name, email, class_id FROM profiles WHERE id = ?",
            [&id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((name, email, class_id)) = row else {
        return Err(AppError::not_found("profile", id));
    };
    let role = auth::role_of(conn, &id)?;

    let mut out = json!({
        "id": id,
        "name": name,
        "email": email,
        "classId": class_id,
        "role": role,
    });
    match role {
        Some(Role::Student) => {
            let status = calc::student_status(conn, &id)?;
            out["status"] = json!(status.label());
            out["statusDetail"] = json!(status);
        }
        Some(Role::Instructor) => {
            let mut stmt = conn.prepare(
                "SELECT id, class_id, name FROM subjects WHERE teacher_id = ? ORDER BY name",
            )?;
            let subjects = stmt
                .query_map([&id], |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "classId": r.get::<_, String>(1)?,
                        "name": r.get::<_, String>(2)?,
                    }))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            out["status"] = json!("active");
            out["subjects"] = json!(subjects);
        }
        _ => {
            out["status"] = json!("active");
        }
    }
    Ok(out)
}

fn profiles_enroll(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ManageSchool)?;
    let student_id = get_required_str(params, "studentId")?;
    let class_id = get_optional_str(params, "classId")?;
    let student = load_student(conn, &student_id)?;

    if let Some(cid) = class_id.as_deref() {
        require_class(conn, cid)?;
        if student.class_id.as_deref() != Some(cid)
            && !calc::student_status(conn, &student_id)?.is_active()
        {
            return Err(AppError::Conflict(
                "evaded students cannot be enrolled in a class; cancel the evasion first"
                    .to_string(),
            ));
        }
    }
    conn.execute(
        "UPDATE profiles SET class_id = ?, updated_at = ? WHERE id = ?",
        (&class_id, now_ts(), &student_id),
    )
    .map_err(AppError::write("profiles"))?;
    tracing::info!(student_id = %student_id, class_id = ?class_id, by = %who.user_id, "enrollment changed");
    Ok(json!({ "studentId": student_id, "classId": class_id }))
}

fn roles_assign(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::AssignRoles)?;
    let user_id = get_required_str(params, "userId")?;
    let role_raw = get_required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| AppError::bad_params(format!("unknown role: {}", role_raw)))?;

    let tx = write_tx(conn).map_err(AppError::Tx)?;
    let Some(current) = auth::role_of(&tx, &user_id)? else {
        return Err(AppError::not_found("profile", user_id));
    };
    if current == role {
        return Ok(json!({ "userId": user_id, "role": role, "changed": false }));
    }
    if current == Role::Admin && auth::admin_count(&tx)? <= 1 {
        return Err(AppError::Conflict("cannot demote the last admin".to_string()));
    }
    if current == Role::Instructor {
        let teaching: i64 = tx.query_row(
            "SELECT COUNT(*) FROM subjects WHERE teacher_id = ?",
            [&user_id],
            |r| r.get(0),
        )?;
        if teaching > 0 {
            return Err(AppError::Conflict(format!(
                "instructor still teaches {} subject(s); reassign them first",
                teaching
            )));
        }
    }
    let now = now_ts();
    tx.execute(
        "UPDATE user_roles SET role = ?, assigned_by = ?, assigned_at = ? WHERE user_id = ?",
        (role.as_str(), &who.user_id, &now, &user_id),
    )
    .map_err(AppError::write("user_roles"))?;
    if role != Role::Student {
        // Class membership only applies to students.
        tx.execute(
            "UPDATE profiles SET class_id = NULL, updated_at = ? WHERE id = ?",
            (&now, &user_id),
        )
        .map_err(AppError::write("profiles"))?;
    }
    tx.commit().map_err(AppError::Tx)?;

    tracing::info!(user_id = %user_id, from = %current, to = %role, by = %who.user_id, "role assigned");
    Ok(json!({ "userId": user_id, "role": role, "changed": true }))
}

fn handle_profiles_register(state: &mut AppState, req: &Request) -> Value {
    let result = match state.db.as_ref() {
        Some(conn) => profiles_register(conn, &req.params),
        None => Err(AppError::NoWorkspace),
    };
    respond(req, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let op: Op = match req.method.as_str() {
        "profiles.register" => return Some(handle_profiles_register(state, req)),
        "profiles.list" => profiles_list,
        "profiles.get" => profiles_get,
        "profiles.enroll" => profiles_enroll,
        "roles.assign" => roles_assign,
        _ => return None,
    };
    Some(run(state, req, op))
}
