use crate::auth::{self, Identity};
use crate::error::{ok_response, AppError, AppResult};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

pub type Op = fn(&Connection, &Identity, &Value) -> AppResult<Value>;

/// Current identity of the session user. The role is re-read on every call so
/// a `roles.assign` takes effect immediately.
pub fn session_identity(state: &AppState) -> AppResult<Identity> {
    let conn = state.db.as_ref().ok_or(AppError::NoWorkspace)?;
    let who = state
        .session
        .as_ref()
        .ok_or_else(|| AppError::Unauthenticated("call session.begin first".to_string()))?;
    auth::resolve_identity(conn, &who.user_id)
}

/// Runs a session-bound operation and wraps the outcome in the IPC envelope.
pub fn run(state: &AppState, req: &Request, op: Op) -> Value {
    let result = session_identity(state).and_then(|who| match state.db.as_ref() {
        Some(conn) => op(conn, &who, &req.params),
        None => Err(AppError::NoWorkspace),
    });
    respond(req, result)
}

pub fn respond(req: &Request, result: AppResult<Value>) -> Value {
    match result {
        Ok(v) => ok_response(&req.id, v),
        Err(e) => {
            tracing::warn!(method = %req.method, code = e.code(), error = %e, "request rejected");
            e.response(&req.id)
        }
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn get_required_str(params: &Value, key: &str) -> AppResult<String> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(_) => Err(AppError::bad_params(format!("{} must not be empty", key))),
        None => Err(AppError::bad_params(format!("missing {}", key))),
    }
}

pub fn get_optional_str(params: &Value, key: &str) -> AppResult<Option<String>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(AppError::bad_params(format!("{} must be string or null", key))),
    }
}

pub fn get_required_bool(params: &Value, key: &str) -> AppResult<bool> {
    params
        .get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| AppError::bad_params(format!("{} must be boolean", key)))
}

pub fn get_required_f64(params: &Value, key: &str) -> AppResult<f64> {
    let v = params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| AppError::bad_params(format!("{} must be a number", key)))?;
    if !v.is_finite() {
        return Err(AppError::bad_params(format!("{} must be finite", key)));
    }
    Ok(v)
}

pub fn get_required_array<'a>(params: &'a Value, key: &str) -> AppResult<&'a Vec<Value>> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| AppError::bad_params(format!("missing {}", key)))
}

/// Accepts `YYYY-MM-DD` only and returns it re-formatted, so stored dates
/// compare lexically.
pub fn parse_date(raw: &str, key: &str) -> AppResult<String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| AppError::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn get_required_date(params: &Value, key: &str) -> AppResult<String> {
    let raw = get_required_str(params, key)?;
    parse_date(&raw, key)
}

pub fn get_optional_date(params: &Value, key: &str) -> AppResult<Option<String>> {
    get_optional_str(params, key)?
        .map(|raw| parse_date(&raw, key))
        .transpose()
}

pub fn today() -> String {
    chrono::Local::now().date_naive().format("%Y-%m-%d").to_string()
}

pub fn exists(conn: &Connection, sql: &str, id: &str) -> AppResult<bool> {
    Ok(conn
        .query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub fn require_class(conn: &Connection, class_id: &str) -> AppResult<()> {
    if exists(conn, "SELECT 1 FROM classes WHERE id = ?", class_id)? {
        Ok(())
    } else {
        Err(AppError::not_found("class", class_id))
    }
}

#[derive(Debug, Clone)]
pub struct SubjectRef {
    pub id: String,
    pub class_id: String,
    pub name: String,
    pub teacher_id: Option<String>,
}

pub fn load_subject(conn: &Connection, subject_id: &str) -> AppResult<SubjectRef> {
    conn.query_row(
        "SELECT id, class_id, name, teacher_id FROM subjects WHERE id = ?",
        [subject_id],
        |r| {
            Ok(SubjectRef {
                id: r.get(0)?,
                class_id: r.get(1)?,
                name: r.get(2)?,
                teacher_id: r.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("subject", subject_id))
}

#[derive(Debug, Clone)]
pub struct StudentRef {
    pub id: String,
    pub name: String,
    pub class_id: Option<String>,
}

/// Loads a profile that must currently hold the student role.
pub fn load_student(conn: &Connection, student_id: &str) -> AppResult<StudentRef> {
    let row: Option<(StudentRef, String)> = conn
        .query_row(
            "SELECT p.id, p.name, p.class_id, r.role
             FROM profiles p
             JOIN user_roles r ON r.user_id = p.id
             WHERE p.id = ?",
            [student_id],
            |r| {
                Ok((
                    StudentRef {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        class_id: r.get(2)?,
                    },
                    r.get(3)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((s, role)) if role == "student" => Ok(s),
        Some(_) => Err(AppError::bad_params(format!(
            "profile {} is not a student",
            student_id
        ))),
        None => Err(AppError::not_found("student", student_id)),
    }
}
