use crate::auth::{self, Identity};
use crate::db;
use crate::error::{error_response, ok_response, AppError, AppResult};
use crate::ipc::helpers::{get_required_str, respond};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok_response(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "sessionUserId": state.session.as_ref().map(|s| s.user_id.clone())
        }),
    )
}

/// Opens (creating if needed) the workspace database and makes it current.
/// Any active session belongs to the previous workspace and is dropped.
pub fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path, state.config.busy_timeout)?;
    state.session = None;
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    tracing::info!(workspace = %path.display(), "workspace opened");
    Ok(())
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return error_response(&req.id, "bad_params", "missing params.path", None);
    };

    match open_workspace(state, &path) {
        Ok(()) => ok_response(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => error_response(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn handle_session_begin(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> AppResult<Identity> {
        let conn = state.db.as_ref().ok_or(AppError::NoWorkspace)?;
        let user_id = get_required_str(&req.params, "userId")?;
        // Role comes from user_roles only; a host-supplied "role" param is ignored.
        let identity = auth::resolve_identity(conn, &user_id)?;
        Ok(identity)
    })();
    match result {
        Ok(identity) => {
            tracing::info!(user_id = %identity.user_id, role = %identity.role, "session started");
            let body = json!({
                "userId": identity.user_id,
                "name": identity.name,
                "role": identity.role,
            });
            state.session = Some(identity);
            ok_response(&req.id, body)
        }
        Err(e) => {
            state.session = None;
            respond(req, Err(e))
        }
    }
}

fn handle_session_end(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(s) = state.session.take() {
        tracing::info!(user_id = %s.user_id, "session ended");
    }
    ok_response(&req.id, json!({ "ok": true }))
}

fn handle_session_whoami(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> AppResult<Identity> {
        let conn = state.db.as_ref().ok_or(AppError::NoWorkspace)?;
        let who = state
            .session
            .as_ref()
            .ok_or_else(|| AppError::Unauthenticated("no active session".to_string()))?;
        // Re-resolve so a role change made since session.begin is visible.
        let fresh = auth::resolve_identity(conn, &who.user_id)?;
        Ok(fresh)
    })();
    match result {
        Ok(fresh) => {
            let body = json!({
                "userId": fresh.user_id,
                "name": fresh.name,
                "role": fresh.role,
            });
            state.session = Some(fresh);
            ok_response(&req.id, body)
        }
        Err(e) => respond(req, Err(e)),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "session.begin" => Some(handle_session_begin(state, req)),
        "session.end" => Some(handle_session_end(state, req)),
        "session.whoami" => Some(handle_session_whoami(state, req)),
        _ => None,
    }
}
