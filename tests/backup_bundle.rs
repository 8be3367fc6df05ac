mod support;

use serde_json::json;
use support::{seed_school, temp_dir, Sidecar};

#[test]
fn export_then_import_restores_the_snapshot() {
    let ws = temp_dir("schoold-backup-ws");
    let out = temp_dir("schoold-backup-out").join("school.zip");
    let mut s = Sidecar::open(&ws);
    seed_school(&mut s);

    let exported = s.ok(
        "workspace.exportBundle",
        json!({ "outPath": out.to_string_lossy() }),
    );
    assert_eq!(exported["bundleFormat"], "schoold-workspace-v1");
    assert_eq!(exported["dbSha256"].as_str().expect("sha").len(), 64);
    assert!(out.is_file());

    s.ok("classes.create", json!({ "name": "Added later", "year": 2025 }));
    assert_eq!(
        s.ok("classes.list", json!({}))["classes"]
            .as_array()
            .expect("classes")
            .len(),
        2
    );

    let imported = s.ok(
        "workspace.importBundle",
        json!({ "inPath": out.to_string_lossy() }),
    );
    assert_eq!(imported["dbSha256"], exported["dbSha256"]);

    // The import resets the session.
    assert_eq!(s.code("classes.list", json!({})), "unauthenticated");
    s.login("admin");
    let classes = s.ok("classes.list", json!({}));
    let classes = classes["classes"].as_array().expect("classes");
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0]["name"], "7A");

    drop(s);
    let _ = std::fs::remove_dir_all(ws);
    if let Some(parent) = out.parent() {
        let _ = std::fs::remove_dir_all(parent);
    }
}

#[test]
fn bundles_are_admin_only_and_verified() {
    let ws = temp_dir("schoold-backup-guard");
    let mut s = Sidecar::open(&ws);
    seed_school(&mut s);
    let junk = ws.join("junk.zip");
    std::fs::write(&junk, b"definitely not a zip").expect("write junk");

    assert_eq!(
        s.code("workspace.importBundle", json!({ "inPath": junk.to_string_lossy() })),
        "io_failed"
    );
    assert_eq!(
        s.code(
            "workspace.importBundle",
            json!({ "inPath": ws.join("missing.zip").to_string_lossy() })
        ),
        "not_found"
    );
    // A failed import keeps the current database open and intact.
    let classes = s.ok("classes.list", json!({}));
    assert_eq!(classes["classes"][0]["name"], "7A");
    s.ok("classes.create", json!({ "name": "8B", "year": 2024 }));
    assert_eq!(
        s.ok("classes.list", json!({}))["classes"]
            .as_array()
            .expect("classes")
            .len(),
        2
    );

    s.login("sec");
    assert_eq!(
        s.code(
            "workspace.exportBundle",
            json!({ "outPath": ws.join("x.zip").to_string_lossy() })
        ),
        "forbidden"
    );

    drop(s);
    let _ = std::fs::remove_dir_all(ws);
}
