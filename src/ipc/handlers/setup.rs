use crate::auth::{Capability, Identity};
use crate::calc::RiskThresholds;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::ipc::helpers::{get_required_str, run, Op};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Risk,
    Attendance,
    Communications,
}

impl SetupSection {
    const ALL: [SetupSection; 3] = [Self::Risk, Self::Attendance, Self::Communications];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "risk" => Some(Self::Risk),
            "attendance" => Some(Self::Attendance),
            "communications" => Some(Self::Communications),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Risk => "risk",
            Self::Attendance => "attendance",
            Self::Communications => "communications",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Risk => "setup.risk",
            Self::Attendance => "setup.attendance",
            Self::Communications => "setup.communications",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Risk => json!(RiskThresholds::default()),
        SetupSection::Attendance => json!({
            "notifyOnJustification": true,
            "allowFutureDates": false
        }),
        SetupSection::Communications => json!({
            "notifyOnPublish": true,
            "defaultPriority": "normal"
        }),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSettings {
    pub notify_on_justification: bool,
    pub allow_future_dates: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunicationSettings {
    pub notify_on_publish: bool,
    pub default_priority: String,
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .filter(|n| n.is_finite())
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

pub const PRIORITIES: [&str; 4] = ["low", "normal", "high", "urgent"];

pub fn parse_priority(v: &Value, key: &str) -> Result<&'static str, String> {
    let s = v
        .as_str()
        .ok_or_else(|| format!("{} must be string", key))?
        .trim()
        .to_ascii_lowercase();
    PRIORITIES
        .iter()
        .copied()
        .find(|p| *p == s)
        .ok_or_else(|| format!("{} must be one of: {}", key, PRIORITIES.join(", ")))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Risk => match k.as_str() {
                "criticalAttendancePercent"
                | "warningAttendancePercent"
                | "criticalScore"
                | "warningScore" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 0.0, 100.0)?));
                }
                "criticalGradeAverage" | "warningGradeAverage" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 0.0, 10.0)?));
                }
                "attendanceWeight" | "gradeWeight" | "evasionWeight" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 0.0, 100.0)?));
                }
                "recentEvasionDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 3650)?));
                }
                "minRecordsForAttendance" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 1000)?));
                }
                _ => return Err(format!("unknown risk field: {}", k)),
            },
            SetupSection::Attendance => match k.as_str() {
                "notifyOnJustification" | "allowFutureDates" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Communications => match k.as_str() {
                "notifyOnPublish" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "defaultPriority" => {
                    obj.insert(k.clone(), Value::String(parse_priority(v, k)?.to_string()));
                }
                _ => return Err(format!("unknown communications field: {}", k)),
            },
        }
    }
    if let SetupSection::Risk = section {
        check_risk_order(obj)?;
    }
    Ok(())
}

/// Critical bounds must sit on the severe side of the warning bounds.
fn check_risk_order(obj: &Map<String, Value>) -> Result<(), String> {
    let get = |k: &str| obj.get(k).and_then(|v| v.as_f64()).unwrap_or_default();
    if get("criticalAttendancePercent") > get("warningAttendancePercent") {
        return Err("criticalAttendancePercent must be <= warningAttendancePercent".into());
    }
    if get("criticalGradeAverage") > get("warningGradeAverage") {
        return Err("criticalGradeAverage must be <= warningGradeAverage".into());
    }
    if get("criticalScore") < get("warningScore") {
        return Err("criticalScore must be >= warningScore".into());
    }
    Ok(())
}

/// Stored values that do not parse, or that fail field validation, are
/// logged and replaced by the defaults.
fn load_section(conn: &Connection, section: SetupSection) -> AppResult<Value> {
    let current = default_section(section);
    let Some(text) = db::settings_get_text(conn, section.key())? else {
        return Ok(current);
    };
    let saved = match serde_json::from_str::<Value>(&text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(section = section.name(), error = %e, "stored setup section is not valid json");
            return Ok(current);
        }
    };
    let Some(saved_obj) = saved.as_object() else {
        tracing::warn!(section = section.name(), "stored setup section is not an object");
        return Ok(current);
    };
    let mut merged = current.clone();
    match merge_section_patch(section, &mut merged, saved_obj) {
        Ok(()) => Ok(merged),
        Err(msg) => {
            tracing::warn!(section = section.name(), error = %msg, "ignoring stored setup section");
            Ok(current)
        }
    }
}

fn load_typed<T: serde::de::DeserializeOwned>(conn: &Connection, section: SetupSection) -> AppResult<T> {
    let value = load_section(conn, section)?;
    serde_json::from_value(value)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("setup.{}: {}", section.name(), e)))
}

pub fn risk_thresholds(conn: &Connection) -> AppResult<RiskThresholds> {
    load_typed(conn, SetupSection::Risk)
}

pub fn attendance_settings(conn: &Connection) -> AppResult<AttendanceSettings> {
    load_typed(conn, SetupSection::Attendance)
}

pub fn communication_settings(conn: &Connection) -> AppResult<CommunicationSettings> {
    load_typed(conn, SetupSection::Communications)
}

fn setup_get(conn: &Connection, _who: &Identity, _params: &Value) -> AppResult<Value> {
    let mut out = Map::new();
    for section in SetupSection::ALL {
        out.insert(section.name().to_string(), load_section(conn, section)?);
    }
    Ok(Value::Object(out))
}

fn setup_update(conn: &Connection, who: &Identity, params: &Value) -> AppResult<Value> {
    who.require(Capability::EditSetup)?;
    let section_raw = get_required_str(params, "section")?;
    let Some(section) = SetupSection::parse(&section_raw) else {
        return Err(AppError::bad_params("unknown section"));
    };
    let Some(patch_obj) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(AppError::bad_params("patch must be an object"));
    };

    let mut current = load_section(conn, section)?;
    merge_section_patch(section, &mut current, patch_obj).map_err(AppError::Validation)?;
    db::settings_set_json(conn, section.key(), &current)?;
    tracing::info!(section = section.name(), by = %who.user_id, "setup updated");
    let mut out = json!({ "ok": true });
    out[section.name()] = current;
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let op: Op = match req.method.as_str() {
        "setup.get" => setup_get,
        "setup.update" => setup_update,
        _ => return None,
    };
    Some(run(state, req, op))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_patch_is_validated_per_field() {
        let mut cur = default_section(SetupSection::Risk);
        let patch = json!({ "criticalScore": 70, "recentEvasionDays": 30 });
        merge_section_patch(SetupSection::Risk, &mut cur, patch.as_object().expect("obj"))
            .expect("valid patch");
        assert_eq!(cur["criticalScore"], 70.0);
        assert_eq!(cur["recentEvasionDays"], 30);
        let t: RiskThresholds = serde_json::from_value(cur.clone()).expect("typed");
        assert_eq!(t.recent_evasion_days, 30);

        let bad = json!({ "criticalGradeAverage": 11 });
        assert!(merge_section_patch(SetupSection::Risk, &mut cur, bad.as_object().expect("obj")).is_err());
        let unknown = json!({ "bogus": 1 });
        assert!(
            merge_section_patch(SetupSection::Risk, &mut cur, unknown.as_object().expect("obj"))
                .is_err()
        );
    }

    #[test]
    fn risk_patch_keeps_critical_below_warning() {
        let mut cur = default_section(SetupSection::Risk);
        let patch = json!({ "criticalAttendancePercent": 80 });
        let e = merge_section_patch(SetupSection::Risk, &mut cur, patch.as_object().expect("obj"))
            .expect_err("critical above warning");
        assert!(e.contains("criticalAttendancePercent"));
    }

    #[test]
    fn priority_is_a_closed_set() {
        assert_eq!(parse_priority(&json!(" High "), "p"), Ok("high"));
        assert!(parse_priority(&json!("asap"), "p").is_err());
        assert!(parse_priority(&json!(3), "p").is_err());
    }

    #[test]
    fn defaults_deserialize_into_typed_settings() {
        let a: AttendanceSettings =
            serde_json::from_value(default_section(SetupSection::Attendance)).expect("attendance");
        assert!(a.notify_on_justification);
        assert!(!a.allow_future_dates);
        let c: CommunicationSettings =
            serde_json::from_value(default_section(SetupSection::Communications)).expect("comms");
        assert_eq!(c.default_priority, "normal");
    }

    #[test]
    fn unreadable_stored_section_falls_back_to_defaults() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE settings(key TEXT PRIMARY KEY, value_json TEXT NOT NULL);")
            .expect("schema");
        conn.execute(
            "INSERT INTO settings(key, value_json) VALUES('setup.communications', 'not json')",
            [],
        )
        .expect("seed");
        let c = communication_settings(&conn).expect("defaults");
        assert!(c.notify_on_publish);
        assert_eq!(c.default_priority, "normal");

        conn.execute(
            "UPDATE settings SET value_json = '[1, 2]' WHERE key = 'setup.communications'",
            [],
        )
        .expect("array");
        let v = load_section(&conn, SetupSection::Communications).expect("defaults");
        assert_eq!(v, default_section(SetupSection::Communications));
    }
}
