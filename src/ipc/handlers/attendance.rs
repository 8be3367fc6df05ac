use crate::auth::{Capability, Identity, Role};
use crate::calc::{self, AttendanceFilter, AttendanceTally};
use crate::db::{now_ts, write_tx};
use crate::error::{is_unique_violation, AppError, AppResult};
use crate::ipc::handlers::classes::active_roster;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    get_optional_date, get_optional_str, get_required_array, get_required_date, get_required_str,
    load_subject, new_id, run, today, Op,
};
use crate::ipc::types::{AppState, Request};
use crate::model::AttendanceRow;
use crate::notify;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};

const BATCH_MAX_RECORDS: usize = 500;
const EDIT_BATCH_MAX: usize = 2000;
const JUSTIFICATION_MAX_CHARS: usize = 1000;
const ACTIVITY_MAX_CHARS: usize = 4000;

struct NewRecord {
    student_id: String,
    is_present: bool,
    justification: Option<String>,
}

/// Field patch for an existing row. `justification: Some(None)` clears it.
#[derive(Debug, Default)]
struct AttendancePatch {
    is_present: Option<bool>,
    justification: Option<Option<String>>,
}

fn check_justification(text: Option<String>) -> AppResult<Option<String>> {
    match text {
        Some(t) if t.chars().count() > JUSTIFICATION_MAX_CHARS => Err(AppError::bad_params(
            format!("justification length must be <= {}", JUSTIFICATION_MAX_CHARS),
        )),
        other => Ok(other),
    }
}

fn parse_new_record(v: &Value) -> AppResult<NewRecord> {
    let student_id = get_required_str(v, "studentId")?;
    let is_present = v
        .get("isPresent")
        .and_then(|x| x.as_bool())
        .ok_or_else(|| AppError::bad_params("isPresent must be boolean"))?;
    let justification = check_justification(get_optional_str(v, "justification")?)?;
    Ok(NewRecord {
        student_id,
        is_present,
        justification,
    })
}

fn parse_patch(fields: &Value) -> AppResult<AttendancePatch> {
    let Some(obj) = fields.as_object() else {
        return Err(AppError::bad_params("fields must be an object"));
    };
    let mut patch = AttendancePatch::default();
    for (k, v) in obj {
        match k.as_str() {
            "isPresent" => {
                patch.is_present = Some(
                    v.as_bool()
                        .ok_or_else(|| AppError::bad_params("isPresent must be boolean"))?,
                );
            }
            "justification" => {
                let text = get_optional_str(fields, "justification")?;
                patch.justification = Some(check_justification(text)?);
            }
            other => {
                return Err(AppError::bad_params(format!(
                    "unknown attendance field: {}",
                    other
                )))
            }
        }
    }
    if patch.is_present.is_none() && patch.justification.is_none() {
        return Err(AppError::bad_params(
            "fields must set isPresent and/or justification",
        ));
    }
    Ok(patch)
}

fn existing_batches(
    conn: &Connection,
    class_id: &str,
    subject_id: &str,
    date: &str,
) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT batch_id FROM attendance_records
         WHERE class_id = ? AND subject_id = ? AND date = ?
         ORDER BY batch_id",
    )?;
    let ids = stmt
        .query_map((class_id, subject_id, date), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn already_recorded(class_id: &str, subject_id: &str, date: &str, batch_ids: Vec<String>) -> AppError {
    AppError::duplicate(
        "attendance already recorded for this class, subject and date",
        Some(json!({
            "classId": class_id,
            "subjectId": subject_id,
            "date": date,
            "batchIds": batch_ids
        })),
    )
}

fn attendance_check_duplicate(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::RecordAttendance)?;
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date = get_required_date(params, "date")?;
    let batch_ids = existing_batches(conn, &class_id, &subject_id, &date)?;
    Ok(json!({ "duplicate": !batch_ids.is_empty(), "batchIds": batch_ids }))
}

fn batch_summary(conn: &Connection, batch_id: &str) -> AppResult<AttendanceTally> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM attendance_records WHERE batch_id = ?",
        AttendanceRow::COLUMNS
    ))?;
    let rows = stmt
        .query_map([batch_id], AttendanceRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(AttendanceTally::from_rows(&rows))
}

fn notify_justification(conn: &Connection, who: &Identity, count: usize) {
    let enabled = match setup::attendance_settings(conn) {
        Ok(s) => s.notify_on_justification,
        Err(e) => {
            tracing::warn!(error = %e, "could not read attendance settings; skipping notification");
            false
        }
    };
    if !enabled || count == 0 {
        return;
    }
    notify::notify_roles(
        conn,
        &[Role::Admin, Role::Secretary],
        notify::Kind::Justification,
        "New absence justification",
        &format!("{} recorded {} new justification(s)", who.name, count),
    );
}

fn attendance_create_batch(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::RecordAttendance)?;
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date = get_required_date(params, "date")?;
    let batch_id = get_optional_str(params, "batchId")?.unwrap_or_else(new_id);
    if batch_id.len() > 64 {
        return Err(AppError::bad_params("batchId length must be <= 64"));
    }
    let activity = get_optional_str(params, "dailyActivity")?;
    if activity
        .as_deref()
        .is_some_and(|a| a.chars().count() > ACTIVITY_MAX_CHARS)
    {
        return Err(AppError::bad_params(format!(
            "dailyActivity length must be <= {}",
            ACTIVITY_MAX_CHARS
        )));
    }

    let subject = load_subject(conn, &subject_id)?;
    if subject.class_id != class_id {
        return Err(AppError::bad_params("subject does not belong to class"));
    }
    if who.role == Role::Instructor && subject.teacher_id.as_deref() != Some(who.user_id.as_str()) {
        return Err(AppError::Forbidden {
            role: who.role.as_str(),
            capability: Capability::RecordAttendance,
        });
    }
    if !setup::attendance_settings(conn)?.allow_future_dates && date > today() {
        return Err(AppError::bad_params("date must not be in the future"));
    }

    let raw = get_required_array(params, "records")?;
    if raw.is_empty() {
        return Err(AppError::bad_params("records must not be empty"));
    }
    if raw.len() > BATCH_MAX_RECORDS {
        return Err(AppError::bad_params(format!(
            "records must contain at most {} rows",
            BATCH_MAX_RECORDS
        )));
    }
    let roster: HashSet<String> = active_roster(conn, &class_id)?
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut records: Vec<NewRecord> = Vec::with_capacity(raw.len());
    for (index, v) in raw.iter().enumerate() {
        let rec = parse_new_record(v).map_err(|e| AppError::BatchRejected {
            index,
            reason: e.to_string(),
        })?;
        if !seen.insert(rec.student_id.clone()) {
            return Err(AppError::BatchRejected {
                index,
                reason: format!("student {} appears twice", rec.student_id),
            });
        }
        if !roster.contains(&rec.student_id) {
            return Err(AppError::BatchRejected {
                index,
                reason: format!("student {} is not on the active roster", rec.student_id),
            });
        }
        records.push(rec);
    }

    let tx = write_tx(conn).map_err(AppError::Tx)?;

    let previous: Option<(String, String, String)> = tx
        .query_row(
            "SELECT class_id, subject_id, date FROM attendance_records WHERE batch_id = ? LIMIT 1",
            [&batch_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    if let Some((c, s, d)) = previous {
        if c == class_id && s == subject_id && d == date {
            drop(tx);
            let tally = batch_summary(conn, &batch_id)?;
            tracing::info!(batch_id = %batch_id, "roll call retry matched a committed batch");
            return Ok(json!({
                "batchId": batch_id,
                "created": 0,
                "replayed": true,
                "summary": tally
            }));
        }
        return Err(AppError::bad_params(
            "batchId already used for a different roll call",
        ));
    }

    let existing = existing_batches(&tx, &class_id, &subject_id, &date)?;
    if !existing.is_empty() {
        return Err(already_recorded(&class_id, &subject_id, &date, existing));
    }

    let now = now_ts();
    for rec in &records {
        let inserted = tx.execute(
            "INSERT INTO attendance_records(
                id, batch_id, student_id, subject_id, class_id, date,
                is_present, justification, recorded_by, created_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                new_id(),
                &batch_id,
                &rec.student_id,
                &subject_id,
                &class_id,
                &date,
                rec.is_present as i64,
                &rec.justification,
                &who.user_id,
                &now,
            ),
        );
        match inserted {
            Ok(_) => {}
            // A concurrent writer got there first; the unique key is the source of truth.
            Err(e) if is_unique_violation(&e) => {
                return Err(already_recorded(&class_id, &subject_id, &date, Vec::new()));
            }
            Err(e) => return Err(AppError::write("attendance_records")(e)),
        }
    }
    if let Some(description) = activity.as_deref() {
        tx.execute(
            "INSERT INTO daily_activities(
                id, batch_id, class_id, subject_id, date, description, recorded_by, created_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                new_id(),
                &batch_id,
                &class_id,
                &subject_id,
                &date,
                description,
                &who.user_id,
                &now,
            ),
        )
        .map_err(AppError::write("daily_activities"))?;
    }
    tx.commit().map_err(AppError::Tx)?;

    let tally = AttendanceTally {
        total: records.len(),
        present: records.iter().filter(|r| r.is_present).count(),
        absent: records.iter().filter(|r| !r.is_present).count(),
        justified_absences: records
            .iter()
            .filter(|r| !r.is_present && r.justification.is_some())
            .count(),
    };
    tracing::info!(
        batch_id = %batch_id,
        class_id = %class_id,
        subject = %subject.name,
        date = %date,
        rows = records.len(),
        by = %who.user_id,
        "roll call recorded"
    );
    let justified = records.iter().filter(|r| r.justification.is_some()).count();
    notify_justification(conn, who, justified);

    Ok(json!({
        "batchId": batch_id,
        "created": records.len(),
        "replayed": false,
        "summary": tally
    }))
}

/// Applies one patch. Returns whether a justification was added where there was none.
fn apply_patch(conn: &Connection, id: &str, patch: &AttendancePatch, now: &str) -> AppResult<bool> {
    let current: Option<Option<String>> = conn
        .query_row(
            "SELECT justification FROM attendance_records WHERE id = ?",
            [id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(previous_justification) = current else {
        return Err(AppError::not_found("attendance record", id));
    };

    if let Some(p) = patch.is_present {
        conn.execute(
            "UPDATE attendance_records SET is_present = ?, updated_at = ? WHERE id = ?",
            (p as i64, now, id),
        )
        .map_err(AppError::write("attendance_records"))?;
    }
    let mut added = false;
    if let Some(j) = &patch.justification {
        conn.execute(
            "UPDATE attendance_records SET justification = ?, updated_at = ? WHERE id = ?",
            (j, now, id),
        )
        .map_err(AppError::write("attendance_records"))?;
        added = previous_justification.is_none() && j.is_some();
    }
    Ok(added)
}

fn attendance_update_single(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::EditAttendance)?;
    let id = get_required_str(params, "id")?;
    let fields = params
        .get("fields")
        .ok_or_else(|| AppError::bad_params("missing fields"))?;
    let patch = parse_patch(fields)?;

    let tx = write_tx(conn).map_err(AppError::Tx)?;
    let added = apply_patch(&tx, &id, &patch, &now_ts())?;
    tx.commit().map_err(AppError::Tx)?;

    tracing::info!(record_id = %id, by = %who.user_id, "attendance record updated");
    notify_justification(conn, who, added as usize);
    Ok(json!({ "ok": true, "id": id }))
}

fn attendance_update_batch(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::EditAttendance)?;
    let edits = get_required_array(params, "edits")?;
    if edits.len() > EDIT_BATCH_MAX {
        return Err(AppError::bad_params(format!(
            "edits must contain at most {} entries",
            EDIT_BATCH_MAX
        )));
    }
    let mut parsed: Vec<(String, AttendancePatch)> = Vec::with_capacity(edits.len());
    for (index, e) in edits.iter().enumerate() {
        let item = (|| -> AppResult<(String, AttendancePatch)> {
            let id = get_required_str(e, "id")?;
            let fields = e
                .get("fields")
                .ok_or_else(|| AppError::bad_params("missing fields"))?;
            Ok((id, parse_patch(fields)?))
        })()
        .map_err(|err| AppError::BatchRejected {
            index,
            reason: err.to_string(),
        })?;
        parsed.push(item);
    }

    // All or nothing: a missing row rolls back every edit before it.
    let tx = write_tx(conn).map_err(AppError::Tx)?;
    let now = now_ts();
    let mut added = 0usize;
    for (index, (id, patch)) in parsed.iter().enumerate() {
        match apply_patch(&tx, id, patch, &now) {
            Ok(a) => added += a as usize,
            Err(e @ AppError::NotFound { .. }) => {
                return Err(AppError::BatchRejected {
                    index,
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(e),
        }
    }
    tx.commit().map_err(AppError::Tx)?;

    tracing::info!(edits = parsed.len(), by = %who.user_id, "attendance batch updated");
    notify_justification(conn, who, added);
    Ok(json!({ "ok": true, "updated": parsed.len() }))
}

fn attendance_delete_batch(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::EditAttendance)?;
    let raw = get_required_array(params, "ids")?;
    if raw.is_empty() {
        return Err(AppError::bad_params("ids must not be empty"));
    }
    let mut ids: Vec<String> = Vec::with_capacity(raw.len());
    for (index, v) in raw.iter().enumerate() {
        let Some(s) = v.as_str().filter(|s| !s.trim().is_empty()) else {
            return Err(AppError::BatchRejected {
                index,
                reason: "id must be a non-empty string".to_string(),
            });
        };
        ids.push(s.trim().to_string());
    }
    ids.sort();
    ids.dedup();

    let tx = write_tx(conn).map_err(AppError::Tx)?;
    let placeholders = vec!["?"; ids.len()].join(", ");
    let mut stmt = tx.prepare(&format!(
        "SELECT {} FROM attendance_records WHERE id IN ({})",
        AttendanceRow::COLUMNS,
        placeholders
    ))?;
    let rows = stmt
        .query_map(params_from_iter(ids.iter()), AttendanceRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    if rows.len() != ids.len() {
        let found: HashSet<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        let missing = ids
            .iter()
            .find(|id| !found.contains(id.as_str()))
            .cloned()
            .unwrap_or_default();
        return Err(AppError::not_found("attendance record", missing));
    }

    let mut sessions: BTreeMap<(String, String, String), usize> = BTreeMap::new();
    for r in &rows {
        *sessions
            .entry((r.class_id.clone(), r.subject_id.clone(), r.date.clone()))
            .or_default() += 1;
    }
    for ((class_id, subject_id, date), selected) in &sessions {
        let total: i64 = tx.query_row(
            "SELECT COUNT(*) FROM attendance_records WHERE class_id = ? AND subject_id = ? AND date = ?",
            (class_id, subject_id, date),
            |r| r.get(0),
        )?;
        if *selected as i64 != total {
            return Err(AppError::Conflict(format!(
                "roll call {} / {} / {} has {} row(s); delete all of them together ({} selected)",
                class_id, subject_id, date, total, selected
            )));
        }
    }

    let batch_ids: HashSet<&str> = rows.iter().map(|r| r.batch_id.as_str()).collect();
    tx.execute(
        &format!("DELETE FROM attendance_records WHERE id IN ({})", placeholders),
        params_from_iter(ids.iter()),
    )
    .map_err(AppError::write("attendance_records"))?;
    for b in &batch_ids {
        tx.execute(
            "DELETE FROM daily_activities
             WHERE batch_id = ?
               AND NOT EXISTS(SELECT 1 FROM attendance_records WHERE batch_id = ?1)",
            [b],
        )
        .map_err(AppError::write("daily_activities"))?;
    }
    tx.commit().map_err(AppError::Tx)?;

    tracing::info!(rows = ids.len(), sessions = sessions.len(), by = %who.user_id, "roll call deleted");
    Ok(json!({ "deleted": ids.len(), "sessions": sessions.len() }))
}

fn parse_filter(who: &Identity, params: &Value) -> AppResult<AttendanceFilter> {
    let mut f = AttendanceFilter {
        class_id: get_optional_str(params, "classId")?,
        subject_id: get_optional_str(params, "subjectId")?,
        student_id: get_optional_str(params, "studentId")?,
        date_from: get_optional_date(params, "dateFrom")?,
        date_to: get_optional_date(params, "dateTo")?,
    };
    if !who.role.is_staff() {
        match f.student_id.as_deref() {
            None => f.student_id = Some(who.user_id.clone()),
            Some(s) => who.require_can_view_student(s)?,
        }
    }
    Ok(f)
}

fn attendance_list(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    let filter = parse_filter(who, params)?;
    let rows = calc::load_attendance(conn, &filter)?;
    let tally = AttendanceTally::from_rows(&rows);
    Ok(json!({ "records": rows, "summary": tally }))
}

fn attendance_roll_calls(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::ViewDirectory)?;
    let filter = parse_filter(who, params)?;
    let rows = calc::load_attendance(conn, &filter)?;
    let groups = calc::group_roll_calls(rows);

    let mut stmt = conn.prepare(
        "SELECT batch_id, description, recorded_by, created_at
         FROM daily_activities WHERE batch_id = ?",
    )?;
    let mut activities: Vec<Value> = Vec::new();
    for g in &groups {
        for b in &g.batch_ids {
            let found = stmt
                .query_row([b], |r| {
                    Ok(json!({
                        "batchId": r.get::<_, String>(0)?,
                        "description": r.get::<_, String>(1)?,
                        "recordedBy": r.get::<_, String>(2)?,
                        "createdAt": r.get::<_, String>(3)?
                    }))
                })
                .optional()?;
            activities.extend(found);
        }
    }
    Ok(json!({ "rollCalls": groups, "dailyActivities": activities }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let op: Op = match req.method.as_str() {
        "attendance.checkDuplicate" => attendance_check_duplicate,
        "attendance.createBatch" => attendance_create_batch,
        "attendance.updateSingle" => attendance_update_single,
        "attendance.updateBatch" => attendance_update_batch,
        "attendance.deleteBatch" => attendance_delete_batch,
        "attendance.list" => attendance_list,
        "attendance.rollCalls" => attendance_roll_calls,
        _ => return None,
    };
    Some(run(state, req, op))
}
