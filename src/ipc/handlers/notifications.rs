use crate::auth::Identity;
use crate::db::now_ts;
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{get_required_array, run, Op};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

fn notifications_list(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    let unread_only = match params.get("unreadOnly") {
        None | Some(Value::Null) => false,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| AppError::bad_params("unreadOnly must be boolean"))?,
    };
    let mut stmt = conn.prepare(
        "SELECT id, title, body, kind, created_at, read_at
         FROM notifications
         WHERE user_id = ?1 AND (?2 = 0 OR read_at IS NULL)
         ORDER BY created_at DESC, id",
    )?;
    let items = stmt
        .query_map((&who.user_id, unread_only), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "body": r.get::<_, String>(2)?,
                "kind": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
                "readAt": r.get::<_, Option<String>>(5)?
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let unread: i64 = conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read_at IS NULL",
        [&who.user_id],
        |r| r.get(0),
    )?;
    Ok(json!({ "notifications": items, "unreadCount": unread }))
}

fn notifications_mark_read(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    let ids = get_required_array(params, "ids")?;
    let now = now_ts();
    let mut marked = 0usize;
    for (index, v) in ids.iter().enumerate() {
        let Some(id) = v.as_str() else {
            return Err(AppError::BatchRejected {
                index,
                reason: "id must be a string".to_string(),
            });
        };
        // Scoped to the session user: other users' ids match nothing.
        marked += conn
            .execute(
                "UPDATE notifications SET read_at = ?
                 WHERE id = ? AND user_id = ? AND read_at IS NULL",
                (&now, id, &who.user_id),
            )
            .map_err(AppError::write("notifications"))?;
    }
    Ok(json!({ "marked": marked }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let op: Op = match req.method.as_str() {
        "notifications.list" => notifications_list,
        "notifications.markRead" => notifications_mark_read,
        _ => return None,
    };
    Some(run(state, req, op))
}
