use crate::auth::Capability;
use rusqlite::ErrorCode;
use serde_json::{json, Value};

/// Failures surfaced to the host. Each variant maps to one stable `code` in the
/// IPC error envelope.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("select a workspace first")]
    NoWorkspace,

    #[error("{0}")]
    Unauthenticated(String),

    #[error("role {role} lacks permission: {capability}")]
    Forbidden {
        role: &'static str,
        capability: Capability,
    },

    #[error("{entity} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{message}")]
    Duplicate {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("batch rejected at index {index}: {reason}")]
    BatchRejected { index: usize, reason: String },

    #[error("{0}")]
    Query(#[from] rusqlite::Error),

    #[error("{source}")]
    Write {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{0}")]
    Tx(rusqlite::Error),

    #[error("{0:#}")]
    Bundle(anyhow::Error),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn duplicate(message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        Self::Duplicate {
            message: message.into(),
            details,
        }
    }

    /// Map-err adapter for writes against `table`.
    pub fn write(table: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Write { table, source }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "bad_params",
            Self::NoWorkspace => "no_workspace",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden { .. } => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::Duplicate { .. } => "duplicate",
            Self::Conflict(_) => "conflict",
            Self::BatchRejected { .. } => "batch_rejected",
            Self::Query(_) => "db_query_failed",
            Self::Write { .. } => "db_update_failed",
            Self::Tx(_) => "db_tx_failed",
            Self::Bundle(_) => "io_failed",
            Self::Internal(_) => "internal",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Forbidden { role, capability } => {
                Some(json!({ "role": role, "capability": capability.as_str() }))
            }
            Self::NotFound { id, .. } => Some(json!({ "id": id })),
            Self::Duplicate { details, .. } => details.clone(),
            Self::BatchRejected { index, reason } => {
                Some(json!({ "index": index, "reason": reason }))
            }
            Self::Write { table, .. } => Some(json!({ "table": table })),
            _ => None,
        }
    }

    pub fn response(&self, id: &str) -> serde_json::Value {
        error_response(id, self.code(), self.to_string(), self.details())
    }
}

/// Success envelope: `{ id, ok: true, result }`.
pub fn ok_response(id: &str, result: Value) -> Value {
    json!({ "id": id, "ok": true, "result": result })
}

/// Failure envelope: `{ id, ok: false, error: { code, message, details? } }`.
pub fn error_response(id: &str, code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message.into() });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({ "id": id, "ok": false, "error": error })
}

/// True when `e` is a UNIQUE/PRIMARY KEY violation.
pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => {
            err.code == ErrorCode::ConstraintViolation
                && matches!(
                    err.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
        }
        _ => false,
    }
}
