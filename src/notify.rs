//! Fire-and-forget notification rows.
//!
//! Callers invoke these after their own write has committed. A failure here is
//! logged and swallowed; it never fails or rolls back the primary write.

use crate::auth::Role;
use crate::db::now_ts;
use rusqlite::{params_from_iter, Connection};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Justification,
    Communication,
    Evasion,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Kind::Justification => "justification",
            Kind::Communication => "communication",
            Kind::Evasion => "evasion",
        }
    }
}

/// Notifies every profile holding one of `roles`. Returns how many rows were
/// written, 0 on failure.
pub fn notify_roles(conn: &Connection, roles: &[Role], kind: Kind, title: &str, body: &str) -> usize {
    match try_notify_roles(conn, roles, kind, title, body) {
        Ok(n) => {
            tracing::debug!(kind = kind.as_str(), recipients = n, "notifications queued");
            n
        }
        Err(e) => {
            tracing::warn!(kind = kind.as_str(), error = %e, "failed to queue notifications");
            0
        }
    }
}

fn try_notify_roles(
    conn: &Connection,
    roles: &[Role],
    kind: Kind,
    title: &str,
    body: &str,
) -> rusqlite::Result<usize> {
    if roles.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; roles.len()].join(", ");
    let sql = format!(
        "SELECT user_id FROM user_roles WHERE role IN ({}) ORDER BY user_id",
        placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let recipients = stmt
        .query_map(params_from_iter(roles.iter().map(|r| r.as_str())), |r| {
            r.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let tx = conn.unchecked_transaction()?;
    let created_at = now_ts();
    for user_id in &recipients {
        tx.execute(
            "INSERT INTO notifications(id, user_id, title, body, kind, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                user_id,
                title,
                body,
                kind.as_str(),
                &created_at,
            ),
        )?;
    }
    tx.commit()?;
    Ok(recipients.len())
}
