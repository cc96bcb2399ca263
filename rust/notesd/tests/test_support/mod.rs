#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ADMIN_EMAIL: &str = "admin@colegio.test";
pub const ADMIN_PASSWORD: &str = "admin-secret";

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

/// One spawned daemon and its pipes.
pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Sidecar {
        Sidecar::spawn_with_env(&[])
    }

    pub fn spawn_with_env(vars: &[(&str, &str)]) -> Sidecar {
        let exe = env!("CARGO_BIN_EXE_notesd");
        let mut cmd = Command::new(exe);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .env_remove("NOTESD_WORKSPACE")
            .env_remove("MAIL_SERVER")
            .env_remove("NOTESD_ADMIN_EMAIL");
        for (k, v) in vars {
            cmd.env(k, v);
        }
        let mut child = cmd.spawn().expect("spawn notesd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Sidecar {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    pub fn send_raw(&mut self, line: &str) -> serde_json::Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response");
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn call(
        &mut self,
        session: Option<&str>,
        method: &str,
        params: serde_json::Value,
    ) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let mut payload = json!({
            "id": id,
            "method": method,
            "params": params,
            "client": { "ip": "127.0.0.1", "userAgent": "notesd-tests" },
        });
        if let Some(s) = session {
            payload["session"] = json!(s);
        }
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn ok(&mut self, session: Option<&str>, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.call(session, method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    /// Expects a failure and returns its error code.
    pub fn err_code(&mut self, session: Option<&str>, method: &str, params: serde_json::Value) -> String {
        let value = self.call(session, method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value["error"]["code"].as_str().unwrap_or("").to_string()
    }

    pub fn select_workspace(&mut self, workspace: &std::path::Path) {
        self.ok(
            None,
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
    }

    pub fn login(&mut self, email: &str, password: &str) -> String {
        let res = self.ok(
            None,
            "auth.login",
            json!({ "loginMethod": "correo", "identifier": email, "password": password }),
        );
        res["session"].as_str().expect("session token").to_string()
    }

    /// Fresh workspace with the first administrator; returns the admin token.
    pub fn bootstrap(&mut self, workspace: &std::path::Path) -> String {
        self.select_workspace(workspace);
        self.ok(
            None,
            "setup.bootstrapAdmin",
            json!({
                "email": ADMIN_EMAIL,
                "firstName": "Ada",
                "lastName": "Admin",
                "password": ADMIN_PASSWORD,
            }),
        );
        self.login(ADMIN_EMAIL, ADMIN_PASSWORD)
    }

    pub fn create_user(&mut self, admin: &str, email: &str, role_id: i64, password: &str) -> String {
        let res = self.ok(
            Some(admin),
            "admin.users.create",
            json!({
                "email": email,
                "firstName": email.split('@').next().unwrap_or("user"),
                "lastName": "Test",
                "roleId": role_id,
                "password": password,
            }),
        );
        res["user"]["id"].as_str().expect("user id").to_string()
    }

    pub fn create_student(&mut self, admin: &str, first_name: &str, teacher_id: Option<&str>) -> String {
        let res = self.ok(
            Some(admin),
            "admin.students.create",
            json!({
                "firstName": first_name,
                "lastName": "Estudiante",
                "grade": "5A",
                "birthDate": "2015-06-01",
                "teacherId": teacher_id,
            }),
        );
        res["student"]["id"].as_str().expect("student id").to_string()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
