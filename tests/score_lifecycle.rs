use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    fn spawn(prefix: &str) -> Sidecar {
        let exe = env!("CARGO_BIN_EXE_registrard");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn registrard");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        let mut sidecar = Sidecar {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        };
        let workspace = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        sidecar.request_ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        sidecar
    }

    fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response");
        let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    fn request_ok(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    fn request_err(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params);
        assert!(
            !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value.get("error").cloned().expect("error payload")
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

struct Fixture {
    instructor: String,
    validator: String,
    student: String,
    subject: String,
}

fn fixture(s: &mut Sidecar) -> Fixture {
    let level = s.request_ok("levels.add", json!({ "name": "Elementary", "scale": "k12" }));
    let staff = |s: &mut Sidecar, name: &str, role: &str| {
        let v = s.request_ok("staff.add", json!({ "name": name, "role": role }));
        str_field(&v, "staffId")
    };
    let instructor = staff(s, "I. Reyes", "instructor");
    let validator = staff(s, "A. Santos", "approver");
    let student = s.request_ok(
        "students.add",
        json!({
            "name": "Dana Flores",
            "academicLevelId": str_field(&level, "levelId"),
            "yearLevel": 4,
            "collegeEnrolled": false,
        }),
    );
    let subject = s.request_ok("subjects.add", json!({ "name": "Mathematics" }));
    Fixture {
        instructor,
        validator,
        student: str_field(&student, "studentId"),
        subject: str_field(&subject, "subjectId"),
    }
}

fn record(s: &mut Sidecar, f: &Fixture, value: f64) -> String {
    let v = s.request_ok(
        "scores.record",
        json!({
            "studentId": f.student,
            "subjectId": f.subject,
            "gradingPeriod": "q1",
            "schoolYear": "2025-2026",
            "value": value,
            "enteredBy": f.instructor,
        }),
    );
    str_field(&v, "scoreId")
}

#[test]
fn happy_path_walks_draft_to_approved() {
    let mut s = Sidecar::spawn("registrard-score-happy");
    let f = fixture(&mut s);
    let score_id = record(&mut s, &f, 88.0);

    for (method, actor, expected) in [
        ("scores.submit", &f.instructor, "submitted"),
        ("scores.validate", &f.validator, "validated"),
        ("scores.approve", &f.validator, "approved"),
    ] {
        let v = s.request_ok(method, json!({ "scoreId": score_id, "actorId": actor }));
        assert_eq!(str_field(&v, "status"), expected);
    }
}

#[test]
fn approved_scores_cannot_be_rekeyed_or_skipped_ahead() {
    let mut s = Sidecar::spawn("registrard-score-frozen");
    let f = fixture(&mut s);
    let score_id = record(&mut s, &f, 88.0);
    s.request_ok("scores.submit", json!({ "scoreId": score_id, "actorId": f.instructor }));
    s.request_ok("scores.validate", json!({ "scoreId": score_id, "actorId": f.validator }));
    s.request_ok("scores.approve", json!({ "scoreId": score_id, "actorId": f.validator }));

    let rekey = s.request_err(
        "scores.record",
        json!({
            "studentId": f.student,
            "subjectId": f.subject,
            "gradingPeriod": "q1",
            "schoolYear": "2025-2026",
            "value": 95.0,
            "enteredBy": f.instructor,
        }),
    );
    assert_eq!(
        rekey.get("code").and_then(|v| v.as_str()),
        Some("validation_failed")
    );

    // Approved is terminal; a return is no longer possible.
    let late_return = s.request_err(
        "scores.return",
        json!({ "scoreId": score_id, "actorId": f.validator, "reason": "typo" }),
    );
    assert_eq!(
        late_return.get("code").and_then(|v| v.as_str()),
        Some("validation_failed")
    );
}

#[test]
fn draft_cannot_jump_straight_to_validated() {
    let mut s = Sidecar::spawn("registrard-score-jump");
    let f = fixture(&mut s);
    let score_id = record(&mut s, &f, 88.0);

    let jump = s.request_err(
        "scores.validate",
        json!({ "scoreId": score_id, "actorId": f.validator }),
    );
    assert_eq!(
        jump.get("code").and_then(|v| v.as_str()),
        Some("validation_failed")
    );
}

#[test]
fn returned_scores_are_corrected_via_reopen() {
    let mut s = Sidecar::spawn("registrard-score-return");
    let f = fixture(&mut s);
    let score_id = record(&mut s, &f, 88.0);
    s.request_ok("scores.submit", json!({ "scoreId": score_id, "actorId": f.instructor }));

    // A return must carry a reason.
    let silent = s.request_err(
        "scores.return",
        json!({ "scoreId": score_id, "actorId": f.validator }),
    );
    assert_eq!(
        silent.get("code").and_then(|v| v.as_str()),
        Some("validation_failed")
    );

    let returned = s.request_ok(
        "scores.return",
        json!({ "scoreId": score_id, "actorId": f.validator, "reason": "wrong column keyed" }),
    );
    assert_eq!(str_field(&returned, "status"), "returned");

    // Returned rows are directly re-keyable; the correction lands as draft.
    let corrected = s.request_ok(
        "scores.record",
        json!({
            "studentId": f.student,
            "subjectId": f.subject,
            "gradingPeriod": "q1",
            "schoolYear": "2025-2026",
            "value": 90.0,
            "enteredBy": f.instructor,
        }),
    );
    assert_eq!(str_field(&corrected, "scoreId"), score_id);
    assert_eq!(str_field(&corrected, "status"), "draft");

    let resubmitted = s.request_ok(
        "scores.submit",
        json!({ "scoreId": score_id, "actorId": f.instructor }),
    );
    assert_eq!(str_field(&resubmitted, "status"), "submitted");
}

#[test]
fn reopen_moves_a_returned_score_back_to_draft() {
    let mut s = Sidecar::spawn("registrard-score-reopen");
    let f = fixture(&mut s);
    let score_id = record(&mut s, &f, 88.0);
    s.request_ok("scores.submit", json!({ "scoreId": score_id, "actorId": f.instructor }));
    s.request_ok(
        "scores.return",
        json!({ "scoreId": score_id, "actorId": f.validator, "reason": "resubmit with proof" }),
    );

    let reopened = s.request_ok(
        "scores.reopen",
        json!({ "scoreId": score_id, "actorId": f.instructor }),
    );
    assert_eq!(str_field(&reopened, "status"), "draft");

    let missing = s.request_err(
        "scores.submit",
        json!({ "scoreId": "no-such-score", "actorId": f.instructor }),
    );
    assert_eq!(missing.get("code").and_then(|v| v.as_str()), Some("not_found"));
}

#[test]
fn transitions_check_the_actor_against_the_staff_registry() {
    let mut s = Sidecar::spawn("registrard-score-actor");
    let f = fixture(&mut s);
    let score_id = record(&mut s, &f, 88.0);

    let ghost = s.request_err(
        "scores.submit",
        json!({ "scoreId": score_id, "actorId": "no-such-staff" }),
    );
    assert_eq!(ghost.get("code").and_then(|v| v.as_str()), Some("not_found"));

    s.request_ok("scores.submit", json!({ "scoreId": score_id, "actorId": f.instructor }));

    // Validation and approval need the approval capability, so one instructor
    // cannot walk a score through the whole machine alone.
    let solo = s.request_err(
        "scores.validate",
        json!({ "scoreId": score_id, "actorId": f.instructor }),
    );
    assert_eq!(solo.get("code").and_then(|v| v.as_str()), Some("role_separation"));

    s.request_ok("scores.validate", json!({ "scoreId": score_id, "actorId": f.validator }));
    let solo = s.request_err(
        "scores.approve",
        json!({ "scoreId": score_id, "actorId": f.instructor }),
    );
    assert_eq!(solo.get("code").and_then(|v| v.as_str()), Some("role_separation"));

    s.request_ok("scores.approve", json!({ "scoreId": score_id, "actorId": f.validator }));
}
