mod support;

use serde_json::json;
use support::{seed_school, str_of, temp_dir, Sidecar};

#[test]
fn evade_then_cancel_restores_prior_status() {
    let ws = temp_dir("schoold-evasion-cycle");
    let mut s = Sidecar::open(&ws);
    let school = seed_school(&mut s);
    s.login("sec");

    let before = s.ok("evasion.status", json!({ "studentId": "s2" }));
    assert_eq!(before["status"], "active");

    let preview = s.ok(
        "evasion.create",
        json!({ "studentId": "s2", "date": "2024-03-01", "reason": "moved to another city" }),
    );
    assert_eq!(preview["requiresConfirmation"], true);
    assert_eq!(preview["impact"]["class"]["id"], school.class_id.as_str());
    assert_eq!(preview["impact"]["rosterSubjects"][0]["name"], "Math");
    let unchanged = s.ok("evasion.status", json!({ "studentId": "s2" }));
    assert_eq!(unchanged["status"], "active", "preview must not write");

    let created = s.ok(
        "evasion.create",
        json!({ "studentId": "s2", "date": "2024-03-01", "reason": "moved to another city", "confirm": true }),
    );
    assert_eq!(created["alreadyEvaded"], false);
    assert_eq!(created["status"]["state"], "evaded");
    assert_eq!(created["status"]["since"], "2024-03-01");
    let evasion_id = str_of(&created["evasion"], "id");

    let status = s.ok("evasion.status", json!({ "studentId": "s2" }));
    assert_eq!(status["status"], "inactive");
    let profile = s.ok("profiles.get", json!({ "id": "s2" }));
    assert_eq!(profile["status"], "inactive");

    let roster = s.ok("classes.roster", json!({ "classId": school.class_id }));
    let names: Vec<String> = roster["students"]
        .as_array()
        .expect("students")
        .iter()
        .map(|st| str_of(st, "id"))
        .collect();
    assert_eq!(names, vec!["s1".to_string(), "s3".to_string()]);

    let batch = json!({
        "classId": school.class_id,
        "subjectId": school.subject_id,
        "date": "2024-03-04",
        "records": [
            { "studentId": "s1", "isPresent": true },
            { "studentId": "s2", "isPresent": true }
        ]
    });
    let e = s.fail("attendance.createBatch", batch);
    assert_eq!(e["code"], "batch_rejected");
    assert_eq!(e["details"]["index"], 1);

    // A second create does not double-apply.
    let again = s.ok(
        "evasion.create",
        json!({ "studentId": "s2", "date": "2024-03-05", "reason": "again", "confirm": true }),
    );
    assert_eq!(again["alreadyEvaded"], true);
    assert_eq!(again["evasion"]["id"], evasion_id.as_str());
    let all = s.ok("evasion.list", json!({ "studentId": "s2" }));
    assert_eq!(all["evasions"].as_array().expect("evasions").len(), 1);

    let cancelled = s.ok(
        "evasion.cancel",
        json!({ "evasionId": evasion_id, "studentId": "s2" }),
    );
    assert_eq!(cancelled["changed"], true);
    assert_eq!(cancelled["evasion"]["status"], "cancelled");
    assert_eq!(cancelled["evasion"]["cancelledBy"], "sec");

    let twice = s.ok(
        "evasion.cancel",
        json!({ "evasionId": evasion_id, "studentId": "s2" }),
    );
    assert_eq!(twice["changed"], false);

    let after = s.ok("evasion.status", json!({ "studentId": "s2" }));
    assert_eq!(after, before);

    let history = s.ok("evasion.list", json!({ "studentId": "s2", "status": "cancelled" }));
    assert_eq!(history["evasions"].as_array().expect("evasions").len(), 1);
    assert_eq!(history["evasions"][0]["date"], "2024-03-01");

    let roster = s.ok("classes.roster", json!({ "classId": school.class_id }));
    assert_eq!(roster["students"].as_array().expect("students").len(), 3);

    drop(s);
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn evasion_rules_and_permissions() {
    let ws = temp_dir("schoold-evasion-rules");
    let mut s = Sidecar::open(&ws);
    let school = seed_school(&mut s);
    let other_class = s.ok("classes.create", json!({ "name": "8B", "year": 2024 }));
    let other_class_id = str_of(&other_class, "classId");

    s.login("coord");
    assert_eq!(
        s.code(
            "evasion.create",
            json!({ "studentId": "s1", "date": "2024-03-01", "reason": "x", "confirm": true })
        ),
        "forbidden"
    );

    s.login("admin");
    assert_eq!(
        s.code(
            "evasion.create",
            json!({ "studentId": "tutor", "date": "2024-03-01", "reason": "x", "confirm": true })
        ),
        "bad_params"
    );
    let created = s.ok(
        "evasion.create",
        json!({ "studentId": "s1", "date": "2024-03-01", "reason": "dropped out", "confirm": true }),
    );
    let evasion_id = str_of(&created["evasion"], "id");

    assert_eq!(
        s.code(
            "profiles.enroll",
            json!({ "studentId": "s1", "classId": other_class_id })
        ),
        "conflict"
    );
    assert_eq!(
        s.code(
            "evasion.cancel",
            json!({ "evasionId": evasion_id, "studentId": "s2" })
        ),
        "bad_params"
    );
    assert_eq!(
        s.code(
            "evasion.cancel",
            json!({ "evasionId": "missing", "studentId": "s1" })
        ),
        "not_found"
    );

    let classes = s.ok("classes.list", json!({}));
    let row = classes["classes"]
        .as_array()
        .expect("classes")
        .iter()
        .find(|c| c["id"] == school.class_id.as_str())
        .cloned()
        .expect("class row");
    assert_eq!(row["activeStudentCount"], 2);
    assert_eq!(row["evadedStudentCount"], 1);

    // Students read only their own status.
    s.login("s2");
    assert_eq!(
        s.code("evasion.status", json!({ "studentId": "s1" })),
        "forbidden"
    );
    let mine = s.ok("evasion.list", json!({}));
    assert_eq!(mine["evasions"].as_array().expect("evasions").len(), 0);

    // Coordinators and tutors hear about evasions.
    s.login("tutor");
    let n = s.ok("notifications.list", json!({}));
    assert_eq!(n["notifications"][0]["kind"], "evasion");

    drop(s);
    let _ = std::fs::remove_dir_all(ws);
}
