use crate::aggregate::EngineError;
use crate::db;
use crate::honor;
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{param_f64, param_str};
use crate::ipc::types::{AppState, Request};
use crate::workflow::StaffRole;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn student_level(conn: &Connection, student_id: &str) -> Result<String, EngineError> {
    let level: Option<String> = conn
        .query_row(
            "SELECT academic_level_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(EngineError::db)?;
    level.ok_or_else(|| EngineError::new("not_found", "student not found"))
}

fn require_admin(conn: &Connection, actor_id: &str) -> Result<(), EngineError> {
    let role: Option<String> = conn
        .query_row("SELECT role FROM staff WHERE id = ?", [actor_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(EngineError::db)?;
    let Some(role) = role else {
        return Err(EngineError::new("not_found", "actor not found"));
    };
    match StaffRole::parse(&role) {
        Some(r) if r.can_administer() => Ok(()),
        _ => Err(EngineError::new(
            "role_separation",
            "honor overrides require the admin role",
        )),
    }
}

fn handle_evaluate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = param_str(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(school_year) = param_str(req, "schoolYear") else {
        return err(&req.id, "bad_params", "missing schoolYear", None);
    };

    match honor::recompute_for_student(conn, student_id, school_year) {
        Ok(rows) => ok(
            &req.id,
            json!({ "honors": serde_json::to_value(&rows).unwrap_or_else(|_| json!([])) }),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = param_str(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(school_year) = param_str(req, "schoolYear") else {
        return err(&req.id, "bad_params", "missing schoolYear", None);
    };
    let level_id = match param_str(req, "academicLevelId") {
        Some(v) => v.to_string(),
        None => match student_level(conn, student_id) {
            Ok(v) => v,
            Err(e) => return engine_err(&req.id, e),
        },
    };

    match honor::list_results(conn, student_id, &level_id, school_year) {
        Ok(rows) => ok(
            &req.id,
            json!({ "honors": serde_json::to_value(&rows).unwrap_or_else(|_| json!([])) }),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

/// Force an honor outcome for a student. The overridden row becomes
/// authoritative: recomputation skips it until the override is cleared.
fn handle_override(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = param_str(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(honor_type_id) = param_str(req, "honorTypeId") else {
        return err(&req.id, "bad_params", "missing honorTypeId", None);
    };
    let Some(school_year) = param_str(req, "schoolYear") else {
        return err(&req.id, "bad_params", "missing schoolYear", None);
    };
    let Some(actor_id) = param_str(req, "actorId") else {
        return err(&req.id, "bad_params", "missing actorId", None);
    };
    let reason = param_str(req, "reason").unwrap_or("");
    if reason.trim().is_empty() {
        return err(&req.id, "validation_failed", "override requires a reason", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = require_admin(&tx, actor_id) {
        return engine_err(&req.id, e);
    }
    let level_id = match student_level(&tx, student_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };

    // Keep the recorded GPA: explicit param, else the existing row's value,
    // else zero for a purely forced award.
    let existing_gpa: Option<f64> = match tx
        .query_row(
            "SELECT gpa FROM honor_results
             WHERE student_id = ? AND honor_type_id = ? AND academic_level_id = ?
               AND school_year = ?",
            (student_id, honor_type_id, &level_id, school_year),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let gpa = param_f64(req, "gpa").or(existing_gpa).unwrap_or(0.0);

    let row_id = Uuid::new_v4().to_string();
    let upsert = tx.execute(
        "INSERT INTO honor_results(
             id, student_id, honor_type_id, academic_level_id, school_year,
             gpa, is_overridden, override_reason, overridden_by)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?)
         ON CONFLICT(student_id, honor_type_id, academic_level_id, school_year)
         DO UPDATE SET gpa = excluded.gpa,
                       is_overridden = 1,
                       override_reason = excluded.override_reason,
                       overridden_by = excluded.overridden_by",
        (
            &row_id,
            student_id,
            honor_type_id,
            &level_id,
            school_year,
            gpa,
            reason,
            actor_id,
        ),
    );
    if let Err(e) = upsert {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = db::audit(&tx, actor_id, "honor.override", "honor_result", student_id, Some(reason))
    {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    match honor::list_results(conn, student_id, &level_id, school_year) {
        Ok(rows) => ok(
            &req.id,
            json!({ "honors": serde_json::to_value(&rows).unwrap_or_else(|_| json!([])) }),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

/// Drop the override flag. The row returns to machine control; the next
/// recomputation reconciles it against current grades and criteria.
fn handle_clear_override(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = param_str(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(honor_type_id) = param_str(req, "honorTypeId") else {
        return err(&req.id, "bad_params", "missing honorTypeId", None);
    };
    let Some(school_year) = param_str(req, "schoolYear") else {
        return err(&req.id, "bad_params", "missing schoolYear", None);
    };
    let Some(actor_id) = param_str(req, "actorId") else {
        return err(&req.id, "bad_params", "missing actorId", None);
    };
    let reason = param_str(req, "reason").unwrap_or("");
    if reason.trim().is_empty() {
        return err(
            &req.id,
            "validation_failed",
            "clearing an override requires a reason",
            None,
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = require_admin(&tx, actor_id) {
        return engine_err(&req.id, e);
    }
    let level_id = match student_level(&tx, student_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };

    let changed = match tx.execute(
        "UPDATE honor_results
         SET is_overridden = 0, override_reason = NULL, overridden_by = NULL
         WHERE student_id = ? AND honor_type_id = ? AND academic_level_id = ?
           AND school_year = ? AND is_overridden = 1",
        (student_id, honor_type_id, &level_id, school_year),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "no overridden honor result to clear", None);
    }
    if let Err(e) = db::audit(
        &tx,
        actor_id,
        "honor.clear_override",
        "honor_result",
        student_id,
        Some(reason),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "cleared": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "honors.evaluate" => Some(handle_evaluate(state, req)),
        "honors.list" => Some(handle_list(state, req)),
        "honors.override" => Some(handle_override(state, req)),
        "honors.clearOverride" => Some(handle_clear_override(state, req)),
        _ => None,
    }
}
