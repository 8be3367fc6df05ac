mod support;

use serde_json::json;
use support::{temp_dir, Sidecar};

#[test]
fn roles_come_from_the_store_not_the_request() {
    let ws = temp_dir("schoold-roles-trust");
    let mut s = Sidecar::open(&ws);

    let first = s.ok("profiles.register", json!({ "userId": "u-admin", "name": "First" }));
    assert_eq!(first["role"], "admin");
    let second = s.ok(
        "profiles.register",
        json!({ "userId": "u-student", "name": "Second", "role": "admin" }),
    );
    assert_eq!(second["role"], "student");
    assert_eq!(
        s.code("profiles.register", json!({ "userId": "u-student", "name": "Again" })),
        "duplicate"
    );

    let who = s.ok("session.begin", json!({ "userId": "u-student", "role": "admin" }));
    assert_eq!(who["role"], "student");
    assert_eq!(
        s.code("classes.create", json!({ "name": "7A", "year": 2024, "role": "admin" })),
        "forbidden"
    );
    let e = s.fail("roles.assign", json!({ "userId": "u-student", "role": "admin" }));
    assert_eq!(e["code"], "forbidden");
    assert_eq!(e["details"]["capability"], "assign_roles");
    assert_eq!(s.code("profiles.list", json!({})), "forbidden");

    assert_eq!(
        s.code("session.begin", json!({ "userId": "nobody" })),
        "unauthenticated"
    );
    // A failed begin leaves no session behind.
    assert_eq!(s.code("session.whoami", json!({})), "unauthenticated");

    drop(s);
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn role_changes_and_last_admin_guard() {
    let ws = temp_dir("schoold-roles-assign");
    let mut s = Sidecar::open(&ws);
    s.ok("profiles.register", json!({ "userId": "a1", "name": "Admin One" }));
    s.ok("profiles.register", json!({ "userId": "u2", "name": "User Two" }));
    s.login("a1");

    assert_eq!(
        s.code("roles.assign", json!({ "userId": "a1", "role": "secretary" })),
        "conflict"
    );
    assert_eq!(
        s.code("roles.assign", json!({ "userId": "u2", "role": "principal" })),
        "bad_params"
    );
    assert_eq!(
        s.code("roles.assign", json!({ "userId": "ghost", "role": "tutor" })),
        "not_found"
    );

    let changed = s.ok("roles.assign", json!({ "userId": "u2", "role": "admin" }));
    assert_eq!(changed["changed"], true);
    let same = s.ok("roles.assign", json!({ "userId": "u2", "role": "admin" }));
    assert_eq!(same["changed"], false);

    // With a second admin the first may step down; whoami picks it up.
    s.ok("roles.assign", json!({ "userId": "a1", "role": "secretary" }));
    let me = s.ok("session.whoami", json!({}));
    assert_eq!(me["role"], "secretary");
    assert_eq!(
        s.code("roles.assign", json!({ "userId": "u2", "role": "tutor" })),
        "forbidden"
    );

    let admins = s.ok("profiles.list", json!({ "role": "admin" }));
    let list = admins["profiles"].as_array().expect("profiles");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], "u2");

    drop(s);
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn classes_with_dependents_cannot_be_deleted() {
    let ws = temp_dir("schoold-classes-delete");
    let mut s = Sidecar::open(&ws);
    s.ok("profiles.register", json!({ "userId": "a1", "name": "Admin" }));
    s.ok("profiles.register", json!({ "userId": "st", "name": "Student" }));
    s.login("a1");

    let c = s.ok("classes.create", json!({ "name": "9C", "year": 2024 }));
    let class_id = c["classId"].as_str().expect("classId").to_string();
    assert_eq!(
        s.code("classes.create", json!({ "name": "Bad", "year": 12 })),
        "bad_params"
    );
    s.ok("profiles.enroll", json!({ "studentId": "st", "classId": class_id }));
    assert_eq!(
        s.code("classes.delete", json!({ "classId": class_id })),
        "conflict"
    );
    assert_eq!(
        s.code(
            "subjects.create",
            json!({ "classId": class_id, "name": "Art", "teacherId": "st" })
        ),
        "bad_params"
    );

    s.ok("profiles.enroll", json!({ "studentId": "st", "classId": null }));
    s.ok("classes.delete", json!({ "classId": class_id }));
    assert_eq!(
        s.code("classes.roster", json!({ "classId": class_id })),
        "not_found"
    );

    drop(s);
    let _ = std::fs::remove_dir_all(ws);
}
