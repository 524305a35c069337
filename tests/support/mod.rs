#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub const PASSWORD: &str = "secret-pass";

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
    pub workspace: PathBuf,
    /// Captured stderr of the child.
    pub log_path: PathBuf,
}

impl Sidecar {
    /// Spawns the binary without selecting a workspace.
    pub fn spawn(prefix: &str) -> Self {
        let exe = env!("CARGO_BIN_EXE_instituted");
        let workspace = temp_dir(prefix);
        let log_path = workspace.with_extension("log");
        let log_file = std::fs::File::create(&log_path).expect("create log file");
        let mut child = Command::new(exe)
            .env_remove("INSTITUTED_WORKSPACE")
            .env("INSTITUTED_LOG", "info")
            .env("INSTITUTED_BCRYPT_COST", "4")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log_file))
            .spawn()
            .expect("spawn instituted");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
            workspace,
            log_path,
        }
    }

    /// Spawns the binary and selects a fresh workspace.
    pub fn start(prefix: &str) -> Self {
        let mut s = Self::spawn(prefix);
        let ws = s.workspace.to_string_lossy().to_string();
        s.ok("workspace.select", json!({ "path": ws }), None);
        s
    }

    pub fn send_raw(&mut self, line: &str) -> serde_json::Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn call(
        &mut self,
        method: &str,
        params: serde_json::Value,
        token: Option<&str>,
    ) -> serde_json::Value {
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
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn ok(
        &mut self,
        method: &str,
        params: serde_json::Value,
        token: Option<&str>,
    ) -> serde_json::Value {
        let value = self.call(method, params, token);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    /// Asserts failure and returns the error code.
    pub fn err_code(
        &mut self,
        method: &str,
        params: serde_json::Value,
        token: Option<&str>,
    ) -> String {
        let value = self.call(method, params, token);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value["error"]["code"]
            .as_str()
            .expect("error code")
            .to_string()
    }

    /// Signs up a user with the given role and returns (id, token).
    pub fn signup(&mut self, name: &str, email: &str, role: &str) -> (String, String) {
        let res = self.ok(
            "auth.signup",
            json!({
                "name": name,
                "email": email,
                "password": PASSWORD,
                "role": role,
                "contactInfo": "+1 555 0100 200",
            }),
            None,
        );
        (
            res["user"]["id"].as_str().expect("user id").to_string(),
            res["token"].as_str().expect("token").to_string(),
        )
    }

    pub fn login(&mut self, email: &str) -> String {
        let res = self.ok(
            "auth.login",
            json!({ "email": email, "password": PASSWORD }),
            None,
        );
        res["token"].as_str().expect("token").to_string()
    }
}

impl Sidecar {
    /// Latest verification token logged for `email`. Mail delivery is not
    /// part of the process, so the log is where tokens surface.
    pub fn verification_token(&self, email: &str) -> String {
        let log = std::fs::read_to_string(&self.log_path).expect("read sidecar log");
        let email_field = format!("email={}", email);
        log.lines()
            .filter(|l| l.contains("event=verification_issued"))
            .filter(|l| l.split_whitespace().any(|f| f == email_field))
            .filter_map(|l| l.split_whitespace().find_map(|f| f.strip_prefix("token=")))
            .last()
            .map(|t| t.to_string())
            .unwrap_or_else(|| panic!("no verification token logged for {}", email))
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.workspace);
        let _ = std::fs::remove_file(&self.log_path);
    }
}

pub struct Account {
    pub id: String,
    pub token: String,
}

/// One admin, one teacher, two students enrolled in a course and placed in
/// a single batch taught by the teacher.
pub struct Institute {
    pub admin: Account,
    pub teacher: Account,
    pub students: Vec<Account>,
    pub course_id: String,
    pub batch_id: String,
    pub enrollment_ids: Vec<String>,
}

pub fn create_teacher(s: &mut Sidecar, admin_token: &str, name: &str, email: &str) -> Account {
    let res = s.ok(
        "teachers.create",
        json!({
            "name": name,
            "email": email,
            "password": PASSWORD,
            "contactInfo": "+1 555 0100 300",
        }),
        Some(admin_token),
    );
    let id = res["teacher"]["id"].as_str().expect("teacher id").to_string();
    let token = s.login(email);
    Account { id, token }
}

pub fn seed_institute(s: &mut Sidecar) -> Institute {
    let (admin_id, admin_token) = s.signup("Ada Admin", "admin@institute.test", "admin");
    let teacher = create_teacher(s, &admin_token, "Tess Teacher", "tess@institute.test");
    let (s1, s1_token) = s.signup("Amy Student", "amy@institute.test", "student");
    let (s2, s2_token) = s.signup("Ben Student", "ben@institute.test", "student");

    let course = s.ok(
        "courses.create",
        json!({
            "name": "Rust Systems",
            "description": "Ownership, borrowing and fearless concurrency",
            "duration": 6,
            "fees": 250.0,
        }),
        Some(&admin_token),
    );
    let course_id = course["course"]["id"].as_str().expect("course id").to_string();

    let batch = s.ok(
        "batches.create",
        json!({
            "name": "Morning Cohort",
            "courseId": course_id,
            "startDate": "2099-01-10",
            "endDate": "2099-06-30",
            "teacherId": teacher.id,
            "maxStudents": 2,
        }),
        Some(&admin_token),
    );
    let batch_id = batch["batch"]["id"].as_str().expect("batch id").to_string();

    let e1 = s.ok(
        "enrollments.enroll",
        json!({ "courseId": course_id }),
        Some(&s1_token),
    );
    let e2 = s.ok(
        "enrollments.enroll",
        json!({ "courseId": course_id, "studentId": s2 }),
        Some(&admin_token),
    );
    let enrollment_ids: Vec<String> = [e1, e2]
        .iter()
        .map(|e| e["enrollment"]["id"].as_str().expect("enrollment id").to_string())
        .collect();
    for eid in &enrollment_ids {
        s.ok(
            "enrollments.assignBatch",
            json!({ "enrollmentId": eid, "batchId": batch_id }),
            Some(&teacher.token),
        );
    }

    Institute {
        admin: Account {
            id: admin_id,
            token: admin_token,
        },
        teacher,
        students: vec![
            Account {
                id: s1,
                token: s1_token,
            },
            Account {
                id: s2,
                token: s2_token,
            },
        ],
        course_id,
        batch_id,
        enrollment_ids,
    }
}

/// Two days of attendance: both present, then only the first student.
pub fn mark_two_days(s: &mut Sidecar, inst: &Institute) {
    let (a, b) = (&inst.students[0].id, &inst.students[1].id);
    s.ok(
        "attendance.mark",
        json!({
            "batchId": inst.batch_id,
            "date": "2025-03-01",
            "presentStudents": [a, b],
            "absentStudents": [],
        }),
        Some(&inst.teacher.token),
    );
    s.ok(
        "attendance.mark",
        json!({
            "batchId": inst.batch_id,
            "date": "2025-03-02",
            "presentStudents": [a],
            "absentStudents": [b],
        }),
        Some(&inst.teacher.token),
    );
}

pub fn create_exam(s: &mut Sidecar, inst: &Institute, name: &str, date: &str, total: f64) -> String {
    let res = s.ok(
        "exams.create",
        json!({
            "name": name,
            "batchId": inst.batch_id,
            "date": date,
            "duration": 60,
            "totalMarks": total,
        }),
        Some(&inst.teacher.token),
    );
    res["exam"]["id"].as_str().expect("exam id").to_string()
}

pub fn assign_marks(s: &mut Sidecar, inst: &Institute, exam_id: &str, student_id: &str, marks: f64) -> serde_json::Value {
    s.ok(
        "exams.assignMarks",
        json!({ "examId": exam_id, "studentId": student_id, "marksObtained": marks }),
        Some(&inst.teacher.token),
    )
}

pub fn assert_close(value: &serde_json::Value, expected: f64) {
    let got = value.as_f64().unwrap_or(f64::NAN);
    assert!(
        (got - expected).abs() < 1e-9,
        "expected {}, got {}",
        expected,
        value
    );
}
