use crate::ipc::error::{err, ok};
use crate::ipc::helpers::param_str;
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

/// Fan a section's students out into a subject's enrollment for a school
/// year. Issued explicitly by whoever creates or reactivates the
/// instructor-to-section assignment, not via a persistence hook. Repeat calls
/// are no-ops for already-enrolled students, and one student's failure never
/// aborts the rest of the batch.
fn handle_sync_section(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_id) = param_str(req, "sectionId") else {
        return err(&req.id, "bad_params", "missing sectionId", None);
    };
    let Some(subject_id) = param_str(req, "subjectId") else {
        return err(&req.id, "bad_params", "missing subjectId", None);
    };
    let Some(school_year) = param_str(req, "schoolYear") else {
        return err(&req.id, "bad_params", "missing schoolYear", None);
    };

    let section_exists: Option<String> = match conn
        .query_row("SELECT id FROM sections WHERE id = ?", [section_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if section_exists.is_none() {
        return err(&req.id, "not_found", "section not found", None);
    }
    let subject_exists: Option<String> = match conn
        .query_row("SELECT id FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if subject_exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let mut students_stmt = match conn.prepare(
        "SELECT student_id FROM section_students WHERE section_id = ? ORDER BY student_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let student_ids: Vec<String> = match students_stmt
        .query_map([section_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut enrolled: Vec<String> = Vec::new();
    let mut skipped: Vec<String> = Vec::new();
    let mut failed: Vec<serde_json::Value> = Vec::new();

    for student_id in &student_ids {
        let insert = conn.execute(
            "INSERT OR IGNORE INTO subject_enrollments(id, subject_id, student_id, school_year)
             VALUES(?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                subject_id,
                student_id,
                school_year,
            ),
        );
        match insert {
            Ok(0) => skipped.push(student_id.clone()),
            Ok(_) => enrolled.push(student_id.clone()),
            Err(e) => {
                warn!(
                    student_id = %student_id,
                    subject_id = %subject_id,
                    "enrollment cascade failed for one student: {}",
                    e
                );
                failed.push(json!({
                    "studentId": student_id,
                    "code": "db_insert_failed",
                    "message": e.to_string(),
                }));
            }
        }
    }

    ok(
        &req.id,
        json!({
            "enrolled": enrolled,
            "skipped": skipped,
            "failed": failed,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollment.syncSection" => Some(handle_sync_section(state, req)),
        _ => None,
    }
}
