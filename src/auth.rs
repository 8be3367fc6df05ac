//! Identity and role resolution.
//!
//! The role of a session is always read from the `user_roles` table. Request
//! params never contribute to authorization, and handlers ask for a
//! [`Capability`] instead of comparing role strings.

use crate::error::{AppError, AppResult};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Secretary,
    Coordinator,
    Tutor,
    Instructor,
    Student,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Admin,
        Role::Secretary,
        Role::Coordinator,
        Role::Tutor,
        Role::Instructor,
        Role::Student,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Secretary => "secretary",
            Role::Coordinator => "coordinator",
            Role::Tutor => "tutor",
            Role::Instructor => "instructor",
            Role::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "secretary" => Some(Role::Secretary),
            "coordinator" => Some(Role::Coordinator),
            "tutor" => Some(Role::Tutor),
            "instructor" => Some(Role::Instructor),
            "student" => Some(Role::Student),
            _ => None,
        }
    }

    pub fn is_staff(self) -> bool {
        self != Role::Student
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ManageSchool,
    AssignRoles,
    RecordAttendance,
    EditAttendance,
    ManageEvasion,
    RecordGrades,
    DeleteGrades,
    ManageCommunications,
    ViewAggregates,
    ViewDirectory,
    EditSetup,
    ManageWorkspace,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::ManageSchool => "manage_school",
            Capability::AssignRoles => "assign_roles",
            Capability::RecordAttendance => "record_attendance",
            Capability::EditAttendance => "edit_attendance",
            Capability::ManageEvasion => "manage_evasion",
            Capability::RecordGrades => "record_grades",
            Capability::DeleteGrades => "delete_grades",
            Capability::ManageCommunications => "manage_communications",
            Capability::ViewAggregates => "view_aggregates",
            Capability::ViewDirectory => "view_directory",
            Capability::EditSetup => "edit_setup",
            Capability::ManageWorkspace => "manage_workspace",
        }
    }

    /// Role-level grant. Instructors get `RecordAttendance` and `RecordGrades`
    /// here, but callers must still check that the subject is theirs.
    pub fn granted_to(self, role: Role) -> bool {
        use Role::*;
        match self {
            Capability::ManageSchool => matches!(role, Admin | Secretary),
            Capability::AssignRoles | Capability::EditSetup | Capability::ManageWorkspace => {
                role == Admin
            }
            Capability::RecordAttendance => {
                matches!(role, Admin | Secretary | Coordinator | Tutor | Instructor)
            }
            Capability::EditAttendance => matches!(role, Admin | Secretary | Coordinator | Tutor),
            Capability::ManageEvasion => matches!(role, Admin | Secretary),
            Capability::RecordGrades => matches!(role, Admin | Secretary | Instructor),
            Capability::DeleteGrades => matches!(role, Admin | Secretary),
            Capability::ManageCommunications => matches!(role, Admin | Secretary | Coordinator),
            Capability::ViewAggregates => true,
            Capability::ViewDirectory => role.is_staff(),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub name: String,
    pub role: Role,
}

impl Identity {
    pub fn require(&self, capability: Capability) -> AppResult<()> {
        if capability.granted_to(self.role) {
            Ok(())
        } else {
            Err(AppError::Forbidden {
                role: self.role.as_str(),
                capability,
            })
        }
    }

    /// Students may only read their own figures; staff may read anyone's.
    pub fn require_can_view_student(&self, student_id: &str) -> AppResult<()> {
        if self.role.is_staff() || self.user_id == student_id {
            Ok(())
        } else {
            Err(AppError::Forbidden {
                role: self.role.as_str(),
                capability: Capability::ViewAggregates,
            })
        }
    }
}

pub fn role_of(conn: &Connection, user_id: &str) -> AppResult<Option<Role>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT role FROM user_roles WHERE user_id = ?",
            [user_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(raw.as_deref().and_then(Role::parse))
}

/// Resolves an auth-provider user id into a session identity.
pub fn resolve_identity(conn: &Connection, user_id: &str) -> AppResult<Identity> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT p.name, r.role
             FROM profiles p
             LEFT JOIN user_roles r ON r.user_id = p.id
             WHERE p.id = ?",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((name, role_raw)) = row else {
        return Err(AppError::Unauthenticated(format!(
            "no profile registered for user {}",
            user_id
        )));
    };
    let Some(role) = role_raw.as_deref().and_then(Role::parse) else {
        return Err(AppError::Unauthenticated(format!(
            "user {} has no role assigned",
            user_id
        )));
    };
    Ok(Identity {
        user_id: user_id.to_string(),
        name,
        role,
    })
}

pub fn admin_count(conn: &Connection) -> AppResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM user_roles WHERE role = 'admin'",
        [],
        |r| r.get(0),
    )?)
}
