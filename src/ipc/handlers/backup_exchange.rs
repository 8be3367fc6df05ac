use crate::auth::{Capability, Identity};
use crate::backup;
use crate::error::{ok_response, AppError, AppResult};
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::helpers::{get_required_str, respond, session_identity};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;

/// Session gate for workspace-level operations; returns the open workspace path.
fn require_workspace_admin(state: &AppState) -> AppResult<(PathBuf, Identity)> {
    let workspace = state.workspace.clone().ok_or(AppError::NoWorkspace)?;
    let who = session_identity(state)?;
    who.require(Capability::ManageWorkspace)?;
    Ok((workspace, who))
}

fn handle_export_bundle(state: &mut AppState, req: &Request) -> Value {
    let result = (|| -> AppResult<Value> {
        let (workspace, who) = require_workspace_admin(state)?;
        let out_path = get_required_str(&req.params, "outPath")?;
        let out = PathBuf::from(&out_path);
        let export = backup::export_workspace_bundle(&workspace, &out).map_err(AppError::Bundle)?;
        tracing::info!(path = %out.display(), sha256 = %export.db_sha256, by = %who.user_id, "workspace exported");
        Ok(json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "dbSha256": export.db_sha256,
            "dbBytes": export.db_bytes
        }))
    })();
    respond(req, result)
}

fn handle_import_bundle(state: &mut AppState, req: &Request) -> Value {
    let prepared = (|| -> AppResult<(PathBuf, PathBuf, Identity)> {
        let (workspace, who) = require_workspace_admin(state)?;
        let in_path = PathBuf::from(get_required_str(&req.params, "inPath")?);
        if !in_path.is_file() {
            return Err(AppError::not_found("bundle", in_path.to_string_lossy()));
        }
        Ok((workspace, in_path, who))
    })();
    let (workspace, in_path, who) = match prepared {
        Ok(v) => v,
        Err(e) => return respond(req, Err(e)),
    };

    // The current handle stays open until the verified database has been
    // renamed into place; a rejected bundle leaves it serving as before.
    let import = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(v) => v,
        Err(e) => return respond(req, Err(AppError::Bundle(e))),
    };
    state.db = None;

    if let Err(e) = open_workspace(state, &workspace) {
        return respond(req, Err(AppError::Internal(e)));
    }
    tracing::info!(
        path = %in_path.display(),
        sha256 = %import.db_sha256,
        by = %who.user_id,
        "workspace imported; session reset"
    );
    ok_response(
        &req.id,
        json!({
            "ok": true,
            "workspacePath": workspace.to_string_lossy(),
            "bundleFormat": import.bundle_format,
            "dbSha256": import.db_sha256,
            "exportedAt": import.exported_at
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "workspace.exportBundle" => Some(handle_export_bundle(state, req)),
        "workspace.importBundle" => Some(handle_import_bundle(state, req)),
        _ => None,
    }
}
