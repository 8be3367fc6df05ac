use crate::auth::{Capability, Identity, Role};
use crate::db::now_ts;
use crate::error::{AppError, AppResult};
use crate::ipc::handlers::setup::{self, parse_priority};
use crate::ipc::helpers::{get_required_bool, get_required_str, new_id, run, Op};
use crate::ipc::types::{AppState, Request};
use crate::notify;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const TITLE_MAX_CHARS: usize = 200;
const CONTENT_MAX_CHARS: usize = 20_000;

/// Who sees a published communication.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Audience {
    All,
    Roles(Vec<Role>),
}

impl Audience {
    fn parse(v: &Value) -> AppResult<Self> {
        match v {
            Value::String(s) if s.trim().eq_ignore_ascii_case("all") => Ok(Audience::All),
            Value::Array(items) => {
                let mut roles: Vec<Role> = Vec::new();
                for item in items {
                    let role = item.as_str().and_then(Role::parse).ok_or_else(|| {
                        AppError::bad_params(format!("unknown audience role: {}", item))
                    })?;
                    if !roles.contains(&role) {
                        roles.push(role);
                    }
                }
                if roles.is_empty() {
                    return Err(AppError::bad_params("targetAudience must not be empty"));
                }
                Ok(Audience::Roles(roles))
            }
            _ => Err(AppError::bad_params(
                "targetAudience must be \"all\" or a list of roles",
            )),
        }
    }

    fn to_stored(&self) -> String {
        match self {
            Audience::All => "all".to_string(),
            Audience::Roles(roles) => roles
                .iter()
                .map(|r| r.as_str())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    fn from_stored(s: &str) -> Self {
        if s == "all" {
            return Audience::All;
        }
        Audience::Roles(s.split(',').filter_map(Role::parse).collect())
    }

    fn includes(&self, role: Role) -> bool {
        match self {
            Audience::All => true,
            Audience::Roles(roles) => roles.contains(&role),
        }
    }

    fn roles(&self) -> Vec<Role> {
        match self {
            Audience::All => Role::ALL.to_vec(),
            Audience::Roles(roles) => roles.clone(),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Audience::All => json!("all"),
            Audience::Roles(roles) => json!(roles),
        }
    }
}

struct Communication {
    id: String,
    title: String,
    content: String,
    priority: String,
    audience: Audience,
    is_published: bool,
    author_id: String,
    created_at: String,
    updated_at: Option<String>,
    published_at: Option<String>,
}

impl Communication {
    const COLUMNS: &'static str = "id, title, content, priority, target_audience, is_published, \
                                   author_id, created_at, updated_at, published_at";

    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            title: r.get(1)?,
            content: r.get(2)?,
            priority: r.get(3)?,
            audience: Audience::from_stored(&r.get::<_, String>(4)?),
            is_published: r.get::<_, i64>(5)? != 0,
            author_id: r.get(6)?,
            created_at: r.get(7)?,
            updated_at: r.get(8)?,
            published_at: r.get(9)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "title": self.title,
            "content": self.content,
            "priority": self.priority,
            "targetAudience": self.audience.to_json(),
            "isPublished": self.is_published,
            "authorId": self.author_id,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
            "publishedAt": self.published_at
        })
    }
}

fn load_communication(conn: &Connection, id: &str) -> AppResult<Communication> {
    conn.query_row(
        &format!(
            "SELECT {} FROM communications WHERE id = ?",
            Communication::COLUMNS
        ),
        [id],
        Communication::from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("communication", id))
}

fn check_len(s: &str, key: &str, max: usize) -> AppResult<()> {
    if s.chars().count() > max {
        return Err(AppError::bad_params(format!(
            "{} length must be <= {}",
            key, max
        )));
    }
    Ok(())
}

fn communications_create(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ManageCommunications)?;
    let title = get_required_str(params, "title")?;
    let content = get_required_str(params, "content")?;
    check_len(&title, "title", TITLE_MAX_CHARS)?;
    check_len(&content, "content", CONTENT_MAX_CHARS)?;
    let priority = match params.get("priority") {
        None | Some(Value::Null) => setup::communication_settings(conn)?.default_priority,
        Some(v) => parse_priority(v, "priority")
            .map_err(AppError::Validation)?
            .to_string(),
    };
    let audience = Audience::parse(params.get("targetAudience").unwrap_or(&Value::Null))?;

    let id = new_id();
    conn.execute(
        "INSERT INTO communications(
            id, title, content, priority, target_audience, is_published, author_id, created_at
         ) VALUES(?, ?, ?, ?, ?, 0, ?, ?)",
        (
            &id,
            &title,
            &content,
            &priority,
            audience.to_stored(),
            &who.user_id,
            now_ts(),
        ),
    )
    .map_err(AppError::write("communications"))?;
    tracing::info!(communication_id = %id, by = %who.user_id, "communication created");
    Ok(load_communication(conn, &id)?.to_json())
}

fn communications_update(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ManageCommunications)?;
    let id = get_required_str(params, "id")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(AppError::bad_params("patch must be an object"));
    };
    if patch.is_empty() {
        return Err(AppError::bad_params("patch must not be empty"));
    }
    let mut c = load_communication(conn, &id)?;
    let patch_value = Value::Object(patch.clone());
    for (k, v) in patch {
        match k.as_str() {
            "title" => {
                c.title = get_required_str(&patch_value, "title")?;
                check_len(&c.title, "title", TITLE_MAX_CHARS)?;
            }
            "content" => {
                c.content = get_required_str(&patch_value, "content")?;
                check_len(&c.content, "content", CONTENT_MAX_CHARS)?;
            }
            "priority" => {
                c.priority = parse_priority(v, "priority")
                    .map_err(AppError::Validation)?
                    .to_string();
            }
            "targetAudience" => c.audience = Audience::parse(v)?,
            other => {
                return Err(AppError::bad_params(format!(
                    "unknown communication field: {}",
                    other
                )))
            }
        }
    }
    conn.execute(
        "UPDATE communications
         SET title = ?, content = ?, priority = ?, target_audience = ?, updated_at = ?
         WHERE id = ?",
        (
            &c.title,
            &c.content,
            &c.priority,
            c.audience.to_stored(),
            now_ts(),
            &id,
        ),
    )
    .map_err(AppError::write("communications"))?;
    Ok(load_communication(conn, &id)?.to_json())
}

fn communications_publish(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ManageCommunications)?;
    let id = get_required_str(params, "id")?;
    let published = get_required_bool(params, "published")?;
    let before = load_communication(conn, &id)?;
    if before.is_published == published {
        return Ok(json!({ "changed": false, "communication": before.to_json() }));
    }

    let notify_on_publish = published && setup::communication_settings(conn)?.notify_on_publish;
    let published_at = if published { Some(now_ts()) } else { None };
    conn.execute(
        "UPDATE communications SET is_published = ?, published_at = ?, updated_at = ? WHERE id = ?",
        (published as i64, &published_at, now_ts(), &id),
    )
    .map_err(AppError::write("communications"))?;
    tracing::info!(communication_id = %id, published, by = %who.user_id, "communication publish state changed");

    let mut notified = 0;
    if notify_on_publish {
        notified = notify::notify_roles(
            conn,
            &before.audience.roles(),
            notify::Kind::Communication,
            &before.title,
            &format!("New {} priority communication", before.priority),
        );
    }
    Ok(json!({
        "changed": true,
        "notified": notified,
        "communication": load_communication(conn, &id)?.to_json()
    }))
}

fn communications_delete(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ManageCommunications)?;
    let id = get_required_str(params, "id")?;
    let changed = conn
        .execute("DELETE FROM communications WHERE id = ?", [&id])
        .map_err(AppError::write("communications"))?;
    if changed == 0 {
        return Err(AppError::not_found("communication", id));
    }
    tracing::info!(communication_id = %id, by = %who.user_id, "communication deleted");
    Ok(json!({ "ok": true }))
}

fn communications_list(conn: &Connection, who: &Identity, _params: &Value) -> AppResult<Value> {
    let sees_drafts = Capability::ManageCommunications.granted_to(who.role);
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM communications
         WHERE (?1 OR is_published = 1)
         ORDER BY COALESCE(published_at, created_at) DESC, id",
        Communication::COLUMNS
    ))?;
    let items: Vec<Value> = stmt
        .query_map([sees_drafts], Communication::from_row)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|c| sees_drafts || c.audience.includes(who.role))
        .map(|c| c.to_json())
        .collect();
    Ok(json!({ "communications": items }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let op: Op = match req.method.as_str() {
        "communications.create" => communications_create,
        "communications.update" => communications_update,
        "communications.publish" => communications_publish,
        "communications.delete" => communications_delete,
        "communications.list" => communications_list,
        _ => return None,
    };
    Some(run(state, req, op))
}
