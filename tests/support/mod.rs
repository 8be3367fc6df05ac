#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_schoold");
        let mut child = Command::new(exe)
            .env_remove("SCHOOLD_WORKSPACE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn schoold");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    pub fn open(workspace: &Path) -> Self {
        let mut s = Self::spawn();
        s.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
        s
    }

    pub fn send_raw(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        self.read_response()
    }

    /// Writes a request without waiting for the response.
    pub fn send(&mut self, method: &str, params: Value) -> String {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");
        id
    }

    pub fn read_response(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response");
        serde_json::from_str(line.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: Value) -> Value {
        let id = self.send(method, params);
        let value = self.read_response();
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn ok(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or(Value::Null)
    }

    /// Expects a failure and returns the whole error object.
    pub fn fail(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value.get("error").cloned().unwrap_or(Value::Null)
    }

    pub fn code(&mut self, method: &str, params: Value) -> String {
        self.fail(method, params)["code"]
            .as_str()
            .unwrap_or("")
            .to_string()
    }

    pub fn login(&mut self, user_id: &str) -> Value {
        self.ok("session.begin", json!({ "userId": user_id }))
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn str_of(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing string {} in {}", key, v))
        .to_string()
}

/// One class with one subject taught by `teacher`, plus three enrolled
/// students `s1`..`s3`. Staff: `admin` (first registered), `sec`, `coord`,
/// `tutor`, `teacher`.
pub struct School {
    pub class_id: String,
    pub subject_id: String,
    pub students: Vec<String>,
}

pub fn seed_school(s: &mut Sidecar) -> School {
    for (id, name) in [
        ("admin", "Alice Admin"),
        ("sec", "Sam Secretary"),
        ("coord", "Cora Coordinator"),
        ("tutor", "Tom Tutor"),
        ("teacher", "Ian Instructor"),
        ("s1", "Ana"),
        ("s2", "Bruno"),
        ("s3", "Carla"),
    ] {
        s.ok("profiles.register", json!({ "userId": id, "name": name }));
    }
    s.login("admin");
    for (id, role) in [
        ("sec", "secretary"),
        ("coord", "coordinator"),
        ("tutor", "tutor"),
        ("teacher", "instructor"),
    ] {
        s.ok("roles.assign", json!({ "userId": id, "role": role }));
    }
    let class = s.ok("classes.create", json!({ "name": "7A", "year": 2024 }));
    let class_id = str_of(&class, "classId");
    let subject = s.ok(
        "subjects.create",
        json!({ "classId": class_id, "name": "Math", "teacherId": "teacher" }),
    );
    let subject_id = str_of(&subject, "subjectId");
    let students: Vec<String> = ["s1", "s2", "s3"].iter().map(|id| id.to_string()).collect();
    for sid in &students {
        s.ok(
            "profiles.enroll",
            json!({ "studentId": sid, "classId": class_id }),
        );
    }
    School {
        class_id,
        subject_id,
        students,
    }
}
