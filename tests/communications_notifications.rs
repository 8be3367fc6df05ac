mod support;

use serde_json::json;
use support::{seed_school, str_of, temp_dir, Sidecar};

#[test]
fn publishing_targets_the_audience() {
    let ws = temp_dir("schoold-comms-publish");
    let mut s = Sidecar::open(&ws);
    seed_school(&mut s);
    s.login("coord");

    let draft = s.ok(
        "communications.create",
        json!({ "title": "Field trip", "content": "Bring a packed lunch.", "targetAudience": ["student"] }),
    );
    let comm_id = str_of(&draft, "id");
    assert_eq!(draft["isPublished"], false);
    assert_eq!(draft["priority"], "normal");
    assert_eq!(draft["targetAudience"], json!(["student"]));

    s.login("s1");
    let seen = s.ok("communications.list", json!({}));
    assert_eq!(seen["communications"].as_array().expect("list").len(), 0);
    assert_eq!(
        s.code("communications.publish", json!({ "id": comm_id, "published": true })),
        "forbidden"
    );

    s.login("sec");
    let updated = s.ok(
        "communications.update",
        json!({ "id": comm_id, "patch": { "priority": "HIGH" } }),
    );
    assert_eq!(updated["priority"], "high");
    assert_eq!(
        s.code(
            "communications.update",
            json!({ "id": comm_id, "patch": { "priority": "asap" } })
        ),
        "bad_params"
    );
    let published = s.ok(
        "communications.publish",
        json!({ "id": comm_id, "published": true }),
    );
    assert_eq!(published["changed"], true);
    assert_eq!(published["notified"], 3);
    assert!(published["communication"]["publishedAt"].is_string());
    let again = s.ok(
        "communications.publish",
        json!({ "id": comm_id, "published": true }),
    );
    assert_eq!(again["changed"], false);

    s.login("s1");
    let seen = s.ok("communications.list", json!({}));
    assert_eq!(seen["communications"][0]["title"], "Field trip");
    let inbox = s.ok("notifications.list", json!({}));
    assert_eq!(inbox["unreadCount"], 1);
    let note_id = str_of(&inbox["notifications"][0], "id");
    assert_eq!(inbox["notifications"][0]["kind"], "communication");

    s.login("tutor");
    let seen = s.ok("communications.list", json!({}));
    assert_eq!(seen["communications"].as_array().expect("list").len(), 0);
    // Someone else's notification id changes nothing.
    let marked = s.ok("notifications.markRead", json!({ "ids": [note_id] }));
    assert_eq!(marked["marked"], 0);

    s.login("s1");
    let marked = s.ok("notifications.markRead", json!({ "ids": [note_id] }));
    assert_eq!(marked["marked"], 1);
    let inbox = s.ok("notifications.list", json!({ "unreadOnly": true }));
    assert_eq!(inbox["unreadCount"], 0);
    assert_eq!(inbox["notifications"].as_array().expect("list").len(), 0);

    s.login("admin");
    let summary = s.ok("dashboard.summary", json!({}));
    assert_eq!(summary["publishedCommunications"], 1);
    s.ok("communications.delete", json!({ "id": comm_id }));
    assert_eq!(
        s.code("communications.delete", json!({ "id": comm_id })),
        "not_found"
    );

    drop(s);
    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn audience_validation_and_publish_toggle() {
    let ws = temp_dir("schoold-comms-settings");
    let mut s = Sidecar::open(&ws);
    seed_school(&mut s);

    s.ok(
        "setup.update",
        json!({ "section": "communications", "patch": { "notifyOnPublish": false, "defaultPriority": "low" } }),
    );
    assert_eq!(
        s.code(
            "communications.create",
            json!({ "title": "T", "content": "C", "targetAudience": ["principal"] })
        ),
        "bad_params"
    );
    assert_eq!(
        s.code(
            "communications.create",
            json!({ "title": "T", "content": "C" })
        ),
        "bad_params"
    );
    let c = s.ok(
        "communications.create",
        json!({ "title": "All hands", "content": "Assembly at 9.", "targetAudience": "all" }),
    );
    assert_eq!(c["priority"], "low");
    let published = s.ok(
        "communications.publish",
        json!({ "id": c["id"], "published": true }),
    );
    assert_eq!(published["notified"], 0);

    s.login("teacher");
    let seen = s.ok("communications.list", json!({}));
    assert_eq!(seen["communications"].as_array().expect("list").len(), 1);
    let inbox = s.ok("notifications.list", json!({}));
    assert_eq!(inbox["unreadCount"], 0);

    drop(s);
    let _ = std::fs::remove_dir_all(ws);
}
