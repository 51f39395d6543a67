use crate::aggregate::EngineError;
use crate::db;
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{param_f64, param_str};
use crate::ipc::types::{AppState, Request};
use crate::workflow::{self, ScoreStatus, StaffRole};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn actor_role(conn: &Connection, actor_id: &str) -> Result<StaffRole, EngineError> {
    let role: Option<String> = conn
        .query_row("SELECT role FROM staff WHERE id = ?", [actor_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(EngineError::db)?;
    let Some(role) = role else {
        return Err(EngineError::new("not_found", "actor not found"));
    };
    StaffRole::parse(&role)
        .ok_or_else(|| EngineError::validation(format!("actor has unknown role: {}", role)))
}

/// Create or re-key a raw period score. A score stays editable only while
/// draft or returned; anything further along the machine must come back via
/// an explicit return + reopen.
fn handle_scores_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = param_str(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(subject_id) = param_str(req, "subjectId") else {
        return err(&req.id, "bad_params", "missing subjectId", None);
    };
    let Some(grading_period) = param_str(req, "gradingPeriod") else {
        return err(&req.id, "bad_params", "missing gradingPeriod", None);
    };
    let Some(school_year) = param_str(req, "schoolYear") else {
        return err(&req.id, "bad_params", "missing schoolYear", None);
    };
    let Some(entered_by) = param_str(req, "enteredBy") else {
        return err(&req.id, "bad_params", "missing enteredBy", None);
    };
    let value = param_f64(req, "value");

    let level_id: Option<String> = match conn
        .query_row(
            "SELECT academic_level_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(level_id) = level_id else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let existing: Option<(String, String)> = match conn
        .query_row(
            "SELECT id, status FROM period_scores
             WHERE student_id = ? AND subject_id = ? AND grading_period = ? AND school_year = ?",
            (student_id, subject_id, grading_period, school_year),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match existing {
        Some((score_id, status)) => {
            let editable = matches!(
                ScoreStatus::parse(&status),
                Some(ScoreStatus::Draft) | Some(ScoreStatus::Returned)
            );
            if !editable {
                return err(
                    &req.id,
                    "validation_failed",
                    format!("score is {} and cannot be re-keyed", status),
                    Some(json!({ "status": status })),
                );
            }
            let update = conn.execute(
                "UPDATE period_scores SET value = ?, status = 'draft', entered_by = ?
                 WHERE id = ?",
                (value, entered_by, &score_id),
            );
            match update {
                Ok(_) => ok(&req.id, json!({ "scoreId": score_id, "status": "draft" })),
                Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
            }
        }
        None => {
            let score_id = Uuid::new_v4().to_string();
            let insert = conn.execute(
                "INSERT INTO period_scores(
                     id, student_id, subject_id, academic_level_id, grading_period,
                     school_year, value, status, entered_by)
                 VALUES(?, ?, ?, ?, ?, ?, ?, 'draft', ?)",
                (
                    &score_id,
                    student_id,
                    subject_id,
                    &level_id,
                    grading_period,
                    school_year,
                    value,
                    entered_by,
                ),
            );
            match insert {
                Ok(_) => ok(&req.id, json!({ "scoreId": score_id, "status": "draft" })),
                Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
            }
        }
    }
}

fn apply_transition(
    conn: &Connection,
    req: &Request,
    to: ScoreStatus,
    audit_action: Option<&str>,
    require_reason: bool,
    require_approver: bool,
) -> serde_json::Value {
    let Some(score_id) = param_str(req, "scoreId") else {
        return err(&req.id, "bad_params", "missing scoreId", None);
    };
    let Some(actor_id) = param_str(req, "actorId") else {
        return err(&req.id, "bad_params", "missing actorId", None);
    };
    let reason = param_str(req, "reason");
    if require_reason && reason.map(str::trim).unwrap_or("").is_empty() {
        return err(&req.id, "validation_failed", "a reason is required", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let status: Option<String> = match tx
        .query_row("SELECT status FROM period_scores WHERE id = ?", [score_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(status) = status else {
        return err(&req.id, "not_found", "score not found", None);
    };
    let Some(from) = ScoreStatus::parse(&status) else {
        return err(
            &req.id,
            "validation_failed",
            format!("score has unknown status: {}", status),
            None,
        );
    };

    let role = match actor_role(&tx, actor_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    if require_approver && !role.can_approve() {
        return err(
            &req.id,
            "role_separation",
            "this transition requires the approval capability",
            None,
        );
    }

    if let Err(e) = workflow::guard_score_transition(from, to) {
        return engine_err(&req.id, e);
    }

    if let Err(e) = tx.execute(
        "UPDATE period_scores SET status = ? WHERE id = ?",
        (to.as_str(), score_id),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Some(action) = audit_action {
        if let Err(e) = db::audit(&tx, actor_id, action, "period_score", score_id, reason) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "scoreId": score_id, "status": to.as_str() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let (to, audit_action, require_reason, require_approver) = match req.method.as_str() {
        "scores.record" => return Some(handle_scores_record(state, req)),
        "scores.submit" => (ScoreStatus::Submitted, None, false, false),
        "scores.validate" => (ScoreStatus::Validated, None, false, true),
        "scores.approve" => (ScoreStatus::Approved, None, false, true),
        "scores.return" => (ScoreStatus::Returned, Some("score.return"), true, false),
        "scores.reopen" => (ScoreStatus::Draft, Some("score.reopen"), false, false),
        _ => return None,
    };
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(apply_transition(
        conn,
        req,
        to,
        audit_action,
        require_reason,
        require_approver,
    ))
}
