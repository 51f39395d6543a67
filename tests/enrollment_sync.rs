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

fn ids(v: &Value, key: &str) -> Vec<String> {
    v.get(key)
        .and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .map(|r| r.as_str().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default()
}

struct Roster {
    level_id: String,
    section_id: String,
    subject_id: String,
    students: Vec<String>,
}

fn roster(s: &mut Sidecar, size: usize) -> Roster {
    let level = s.request_ok("levels.add", json!({ "name": "Junior High School", "scale": "k12" }));
    let level_id = str_field(&level, "levelId");
    let section = s.request_ok("sections.add", json!({ "name": "Grade 8 - Rizal" }));
    let section_id = str_field(&section, "sectionId");
    let subject = s.request_ok("subjects.add", json!({ "name": "Filipino" }));
    let subject_id = str_field(&subject, "subjectId");
    let mut students = Vec::new();
    for i in 0..size {
        let v = s.request_ok(
            "students.add",
            json!({
                "name": format!("Student {}", i + 1),
                "academicLevelId": level_id,
                "yearLevel": 8,
                "collegeEnrolled": false,
            }),
        );
        let student_id = str_field(&v, "studentId");
        s.request_ok(
            "sections.addStudent",
            json!({ "sectionId": section_id, "studentId": student_id }),
        );
        students.push(student_id);
    }
    Roster {
        level_id,
        section_id,
        subject_id,
        students,
    }
}

#[test]
fn sync_enrolls_every_section_member_once() {
    let mut s = Sidecar::spawn("registrard-sync-once");
    let r = roster(&mut s, 2);
    let params = json!({
        "sectionId": r.section_id,
        "subjectId": r.subject_id,
        "schoolYear": "2025-2026",
    });

    let first = s.request_ok("enrollment.syncSection", params.clone());
    let mut enrolled = ids(&first, "enrolled");
    enrolled.sort();
    let mut expected = r.students.clone();
    expected.sort();
    assert_eq!(enrolled, expected);
    assert!(ids(&first, "skipped").is_empty());
    assert!(first.get("failed").and_then(|v| v.as_array()).map(Vec::is_empty).unwrap_or(false));

    // The whole operation is a no-op on repeat.
    let again = s.request_ok("enrollment.syncSection", params);
    assert!(ids(&again, "enrolled").is_empty());
    let mut skipped = ids(&again, "skipped");
    skipped.sort();
    assert_eq!(skipped, expected);
}

#[test]
fn late_additions_are_picked_up_without_disturbing_existing_rows() {
    let mut s = Sidecar::spawn("registrard-sync-late");
    let r = roster(&mut s, 2);
    let params = json!({
        "sectionId": r.section_id,
        "subjectId": r.subject_id,
        "schoolYear": "2025-2026",
    });
    s.request_ok("enrollment.syncSection", params.clone());

    // A transferee joins the section mid-year.
    let late = s.request_ok(
        "students.add",
        json!({
            "name": "Transferee",
            "academicLevelId": r.level_id,
            "yearLevel": 8,
            "collegeEnrolled": false,
        }),
    );
    let late_id = str_field(&late, "studentId");
    s.request_ok(
        "sections.addStudent",
        json!({ "sectionId": r.section_id, "studentId": late_id }),
    );

    let resync = s.request_ok("enrollment.syncSection", params);
    assert_eq!(ids(&resync, "enrolled"), vec![late_id]);
    assert_eq!(ids(&resync, "skipped").len(), 2);
}

#[test]
fn unknown_section_or_subject_is_rejected() {
    let mut s = Sidecar::spawn("registrard-sync-missing");
    let r = roster(&mut s, 1);

    let bad_section = s.request_err(
        "enrollment.syncSection",
        json!({
            "sectionId": "no-such-section",
            "subjectId": r.subject_id,
            "schoolYear": "2025-2026",
        }),
    );
    assert_eq!(
        bad_section.get("code").and_then(|v| v.as_str()),
        Some("not_found")
    );

    let bad_subject = s.request_err(
        "enrollment.syncSection",
        json!({
            "sectionId": r.section_id,
            "subjectId": "no-such-subject",
            "schoolYear": "2025-2026",
        }),
    );
    assert_eq!(
        bad_subject.get("code").and_then(|v| v.as_str()),
        Some("not_found")
    );
}
