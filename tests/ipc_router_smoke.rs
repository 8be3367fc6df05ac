mod support;

use serde_json::json;
use support::{seed_school, temp_dir, Sidecar};

#[test]
fn envelope_errors_before_workspace_and_session() {
    let mut s = Sidecar::spawn();

    let health = s.ok("health", json!({}));
    assert!(health["workspacePath"].is_null());
    assert!(health["sessionUserId"].is_null());

    let bad = s.send_raw("{not json");
    assert_eq!(bad["ok"], false);
    assert_eq!(bad["error"]["code"], "bad_json");

    assert_eq!(s.code("no.such.method", json!({})), "not_implemented");
    assert_eq!(s.code("classes.list", json!({})), "no_workspace");
    assert_eq!(
        s.code("profiles.register", json!({ "userId": "u1", "name": "U" })),
        "no_workspace"
    );
    assert_eq!(s.code("workspace.select", json!({})), "bad_params");

    let ws = temp_dir("schoold-smoke-session");
    s.ok("workspace.select", json!({ "path": ws.to_string_lossy() }));
    let e = s.fail("classes.list", json!({}));
    assert_eq!(e["code"], "unauthenticated");
    assert_eq!(s.code("session.whoami", json!({})), "unauthenticated");

    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn every_handler_family_is_routed() {
    let ws = temp_dir("schoold-smoke-families");
    let mut s = Sidecar::open(&ws);
    let school = seed_school(&mut s);

    for (method, params) in [
        ("session.whoami", json!({})),
        ("profiles.list", json!({})),
        ("profiles.get", json!({ "id": "s1" })),
        ("classes.list", json!({})),
        ("classes.roster", json!({ "classId": school.class_id })),
        ("subjects.list", json!({ "classId": school.class_id })),
        (
            "attendance.checkDuplicate",
            json!({ "classId": school.class_id, "subjectId": school.subject_id, "date": "2024-03-04" }),
        ),
        ("attendance.list", json!({})),
        ("attendance.rollCalls", json!({})),
        ("evasion.list", json!({})),
        ("evasion.status", json!({ "studentId": "s1" })),
        ("grades.list", json!({})),
        ("stats.attendance", json!({ "scope": "global" })),
        ("stats.grades", json!({})),
        ("stats.risk", json!({})),
        ("dashboard.summary", json!({})),
        ("communications.list", json!({})),
        ("notifications.list", json!({})),
        ("setup.get", json!({})),
    ] {
        s.ok(method, params);
    }

    let health = s.ok("health", json!({}));
    assert_eq!(health["sessionUserId"], "admin");
    s.ok("session.end", json!({}));
    assert_eq!(s.code("classes.list", json!({})), "unauthenticated");

    drop(s);
    let _ = std::fs::remove_dir_all(ws);
}
