#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

pub const ADMIN_USER: &str = "admin";
pub const ADMIN_PASSWORD: &str = "admin-secret-1";
pub const SESSION: &str = "2024/2025";

/// A `schoold ipc` child process over a fresh data directory.
pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
    pub data_dir: tempfile::TempDir,
}

impl Sidecar {
    pub fn spawn() -> Self {
        let data_dir = tempfile::tempdir().expect("temp data dir");
        Self::spawn_in(data_dir)
    }

    pub fn spawn_in(data_dir: tempfile::TempDir) -> Self {
        let exe = env!("CARGO_BIN_EXE_schoold");
        let mut child = Command::new(exe)
            .arg("--data-dir")
            .arg(data_dir.path())
            .arg("ipc")
            .current_dir(data_dir.path())
            .env("SCHOOLD_ADMIN_USERNAME", ADMIN_USER)
            .env("SCHOOLD_ADMIN_PASSWORD", ADMIN_PASSWORD)
            .env("SCHOOLD_TOKEN_SECRET", "integration-test-secret")
            .env_remove("SCHOOLD_DATA_DIR")
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
            data_dir,
        }
    }

    pub fn data_path(&self) -> &Path {
        self.data_dir.path()
    }

    pub fn request(&mut self, token: Option<&str>, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let mut payload = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if let Some(t) = token {
            payload["token"] = json!(t);
        }
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response for {}", method);
        let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn ok(&mut self, token: Option<&str>, method: &str, params: Value) -> Value {
        let value = self.request(token, method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    /// The error code of a call that is expected to fail.
    pub fn fail(&mut self, token: Option<&str>, method: &str, params: Value) -> String {
        let value = self.request(token, method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    pub fn login(&mut self, identifier: &str, password: &str) -> String {
        let result = self.ok(
            None,
            "auth.login",
            json!({ "identifier": identifier, "password": password }),
        );
        result["token"].as_str().expect("token").to_string()
    }

    pub fn admin(&mut self) -> String {
        self.login(ADMIN_USER, ADMIN_PASSWORD)
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub struct School {
    pub branch_id: String,
    pub class_id: String,
    pub maths_id: String,
    pub english_id: String,
    /// `(student_id, sowa_id)` in creation order.
    pub students: Vec<(String, String)>,
}

/// One branch, one class with Mathematics and English, and the named students.
pub fn seed_school(sc: &mut Sidecar, token: &str, students: &[(&str, &str)]) -> School {
    let branch = sc.ok(Some(token), "branches.create", json!({ "name": "Main Campus" }));
    let branch_id = branch["id"].as_str().expect("branch id").to_string();
    let class = sc.ok(
        Some(token),
        "classes.create",
        json!({ "branchId": branch_id, "name": "JSS 1A", "level": 1 }),
    );
    let class_id = class["id"].as_str().expect("class id").to_string();
    let maths = sc.ok(
        Some(token),
        "subjects.create",
        json!({ "classId": class_id, "name": "Mathematics" }),
    );
    let english = sc.ok(
        Some(token),
        "subjects.create",
        json!({ "classId": class_id, "name": "English" }),
    );
    let mut created = Vec::new();
    for (first, last) in students {
        let s = sc.ok(
            Some(token),
            "students.create",
            json!({ "classId": class_id, "firstName": first, "lastName": last }),
        );
        created.push((
            s["id"].as_str().expect("student id").to_string(),
            s["sowaId"].as_str().expect("sowa id").to_string(),
        ));
    }
    School {
        branch_id,
        class_id,
        maths_id: maths["id"].as_str().expect("subject id").to_string(),
        english_id: english["id"].as_str().expect("subject id").to_string(),
        students: created,
    }
}

pub fn save_scores(
    sc: &mut Sidecar,
    token: &str,
    class_id: &str,
    subject_id: &str,
    term: i64,
    entries: Value,
) -> Value {
    sc.ok(
        Some(token),
        "scores.save",
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "term": term,
            "session": SESSION,
            "entries": entries,
        }),
    )
}

pub fn out_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}
