mod support;

use serde_json::json;
use support::{seed_school, temp_dir, School, Sidecar};

fn record(s: &mut Sidecar, school: &School, date: &str, s1_present: bool) {
    s.ok(
        "attendance.createBatch",
        json!({
            "classId": school.class_id,
            "subjectId": school.subject_id,
            "date": date,
            "records": [
                { "studentId": "s1", "isPresent": s1_present },
                { "studentId": "s2", "isPresent": true },
                { "studentId": "s3", "isPresent": true }
            ]
        }),
    );
}

#[test]
fn setup_sections_have_defaults_and_admin_only_updates() {
    let ws = temp_dir("schoold-setup-sections");
    let mut s = Sidecar::open(&ws);
    seed_school(&mut s);

    let setup = s.ok("setup.get", json!({}));
    assert_eq!(setup["risk"]["criticalAttendancePercent"], 60.0);
    assert_eq!(setup["risk"]["recentEvasionDays"], 90);
    assert_eq!(setup["attendance"]["notifyOnJustification"], true);
    assert_eq!(setup["attendance"]["allowFutureDates"], false);
    assert_eq!(setup["communications"]["defaultPriority"], "normal");

    let updated = s.ok(
        "setup.update",
        json!({ "section": "risk", "patch": { "warningAttendancePercent": 90 } }),
    );
    assert_eq!(updated["risk"]["warningAttendancePercent"], 90.0);
    assert_eq!(
        s.code(
            "setup.update",
            json!({ "section": "risk", "patch": { "criticalScore": 150 } })
        ),
        "bad_params"
    );
    assert_eq!(
        s.code(
            "setup.update",
            json!({ "section": "printer", "patch": {} })
        ),
        "bad_params"
    );

    s.login("sec");
    let setup = s.ok("setup.get", json!({}));
    assert_eq!(setup["risk"]["warningAttendancePercent"], 90.0);
    assert_eq!(
        s.code(
            "setup.update",
            json!({ "section": "attendance", "patch": { "allowFutureDates": true } })
        ),
        "forbidden"
    );

    drop(s);
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn risk_listing_orders_by_level_then_score() {
    let ws = temp_dir("schoold-risk-order");
    let mut s = Sidecar::open(&ws);
    let school = seed_school(&mut s);
    s.login("sec");

    // s1: 1 of 3 present; s2 and s3 always present.
    record(&mut s, &school, "2024-03-04", true);
    record(&mut s, &school, "2024-03-05", false);
    record(&mut s, &school, "2024-03-06", false);

    s.ok(
        "grades.create",
        json!({ "studentId": "s2", "subjectId": school.subject_id, "type": "exam", "date": "2024-03-06", "value": 5, "maxValue": 10 }),
    );

    let risk = s.ok("stats.risk", json!({ "classId": school.class_id }));
    let rows = risk["students"].as_array().expect("students");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["studentId"], "s1");
    assert_eq!(rows[0]["riskLevel"], "critical");
    assert_eq!(rows[0]["attendancePercentage"], 33.3);
    assert_eq!(rows[1]["studentId"], "s2");
    assert_eq!(rows[1]["riskLevel"], "warning");
    assert_eq!(rows[2]["studentId"], "s3");
    assert_eq!(rows[2]["riskLevel"], "normal");

    let scoped = s.ok("stats.attendance", json!({ "scope": "student", "id": "s1" }));
    assert_eq!(scoped["total"], 3);
    assert_eq!(scoped["present"], 1);
    assert_eq!(scoped["percentage"], 33.3);
    let class = s.ok(
        "stats.attendance",
        json!({ "scope": "class", "id": school.class_id }),
    );
    assert_eq!(class["total"], 9);
    assert_eq!(class["present"], 7);
    let none = s.ok(
        "stats.attendance",
        json!({ "scope": "subject", "id": "no-such-subject" }),
    );
    assert_eq!(none["total"], 0);
    assert_eq!(none["rate"], 0.0);

    let summary = s.ok("dashboard.summary", json!({}));
    assert_eq!(summary["classes"], 1);
    assert_eq!(summary["activeStudents"], 3);
    assert_eq!(summary["evadedStudents"], 0);
    assert_eq!(summary["atRisk"]["critical"], 1);
    assert_eq!(summary["atRisk"]["warning"], 1);
    assert_eq!(summary["atRisk"]["normal"], 1);

    // Evaded students drop out of the risk listing.
    s.ok(
        "evasion.create",
        json!({ "studentId": "s1", "date": "2024-03-07", "reason": "left", "confirm": true }),
    );
    let risk = s.ok("stats.risk", json!({}));
    assert_eq!(risk["students"].as_array().expect("students").len(), 2);

    s.login("s2");
    assert_eq!(s.code("stats.risk", json!({})), "forbidden");
    assert_eq!(
        s.code("stats.attendance", json!({ "scope": "class", "id": school.class_id })),
        "forbidden"
    );
    let own = s.ok("stats.attendance", json!({ "scope": "student", "id": "s2" }));
    assert_eq!(own["percentage"], 100.0);

    drop(s);
    let _ = std::fs::remove_dir_all(ws);
}
