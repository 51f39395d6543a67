use crate::aggregate::{self, EngineError, GradeComponents, Population, Strategy, TermPair};
use crate::db;
use crate::honor;
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{param_bool, param_f64, param_str};
use crate::ipc::types::{AppState, Request};
use crate::workflow::{self, GradeStatus, StaffRole};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

struct GradeRow {
    id: String,
    student_id: String,
    subject_id: String,
    school_year: String,
    grade_type: String,
    components: GradeComponents,
    overall: Option<f64>,
    overall_is_manual: bool,
    status: GradeStatus,
    submitted_by: Option<String>,
    approved_by: Option<String>,
}

fn load_grade(conn: &Connection, grade_id: &str) -> Result<GradeRow, EngineError> {
    let row = conn
        .query_row(
            "SELECT id, student_id, subject_id, school_year, grade_type,
                    q1, q2, q3, q4, s1_midterm, s1_pre_final, s2_midterm, s2_pre_final,
                    prelim, midterm, final, overall, overall_is_manual, status,
                    submitted_by, approved_by
             FROM subject_grades WHERE id = ?",
            [grade_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    GradeComponents {
                        quarters: [r.get(5)?, r.get(6)?, r.get(7)?, r.get(8)?],
                        semester_pairs: [
                            TermPair {
                                midterm: r.get(9)?,
                                pre_final: r.get(10)?,
                            },
                            TermPair {
                                midterm: r.get(11)?,
                                pre_final: r.get(12)?,
                            },
                        ],
                        prelim: r.get(13)?,
                        midterm: r.get(14)?,
                        final_term: r.get(15)?,
                    },
                    r.get::<_, Option<f64>>(16)?,
                    r.get::<_, i64>(17)? != 0,
                    r.get::<_, String>(18)?,
                    r.get::<_, Option<String>>(19)?,
                    r.get::<_, Option<String>>(20)?,
                ))
            },
        )
        .optional()
        .map_err(EngineError::db)?;

    let Some((
        id,
        student_id,
        subject_id,
        school_year,
        grade_type,
        components,
        overall,
        overall_is_manual,
        status,
        submitted_by,
        approved_by,
    )) = row
    else {
        return Err(EngineError::new("not_found", "grade record not found"));
    };
    let status = GradeStatus::parse(&status).ok_or_else(|| {
        EngineError::validation(format!("grade record has unknown status: {}", status))
    })?;
    Ok(GradeRow {
        id,
        student_id,
        subject_id,
        school_year,
        grade_type,
        components,
        overall,
        overall_is_manual,
        status,
        submitted_by,
        approved_by,
    })
}

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

/// College enrollment wins; otherwise the level name decides. None falls back
/// to the legacy flat strategy.
fn resolve_population(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<Population>, EngineError> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT s.college_enrolled, l.name
             FROM students s
             JOIN academic_levels l ON l.id = s.academic_level_id
             WHERE s.id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(EngineError::db)?;
    let Some((college_enrolled, level_name)) = row else {
        return Err(EngineError::new("not_found", "student not found"));
    };
    Ok(Population::resolve(college_enrolled != 0, &level_name))
}

fn grade_json(row: &GradeRow) -> serde_json::Value {
    let c = &row.components;
    json!({
        "gradeId": row.id,
        "studentId": row.student_id,
        "subjectId": row.subject_id,
        "schoolYear": row.school_year,
        "gradeType": row.grade_type,
        "components": {
            "q1": c.quarters[0], "q2": c.quarters[1],
            "q3": c.quarters[2], "q4": c.quarters[3],
            "s1Midterm": c.semester_pairs[0].midterm,
            "s1PreFinal": c.semester_pairs[0].pre_final,
            "s2Midterm": c.semester_pairs[1].midterm,
            "s2PreFinal": c.semester_pairs[1].pre_final,
            "prelim": c.prelim, "midterm": c.midterm, "final": c.final_term,
        },
        "overall": row.overall,
        "overallIsManual": row.overall_is_manual,
        "status": row.status.as_str(),
        "submittedBy": row.submitted_by,
        "approvedBy": row.approved_by,
    })
}

/// Full-replace of the component slots for a (student, subject, school year)
/// record, creating it on first write. Components are only editable in draft,
/// and any edit drops the stored overall: it must be recomputed before the
/// record can move forward.
fn handle_upsert_components(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = param_str(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(subject_id) = param_str(req, "subjectId") else {
        return err(&req.id, "bad_params", "missing subjectId", None);
    };
    let Some(school_year) = param_str(req, "schoolYear") else {
        return err(&req.id, "bad_params", "missing schoolYear", None);
    };
    let grade_type = param_str(req, "gradeType");
    let Some(c) = req.params.get("components").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing components object", None);
    };

    let comp = |key: &str| c.get(key).and_then(|v| v.as_f64());

    let existing: Option<(String, String)> = match conn
        .query_row(
            "SELECT id, status FROM subject_grades
             WHERE student_id = ? AND subject_id = ? AND school_year = ?",
            (student_id, subject_id, school_year),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match existing {
        Some((grade_id, status)) => {
            if GradeStatus::parse(&status) != Some(GradeStatus::Draft) {
                return err(
                    &req.id,
                    "validation_failed",
                    format!("components are only editable in draft, record is {}", status),
                    Some(json!({ "status": status })),
                );
            }
            // New components invalidate the stored overall, manual or not.
            let update = conn.execute(
                "UPDATE subject_grades SET
                     grade_type = COALESCE(?, grade_type),
                     q1 = ?, q2 = ?, q3 = ?, q4 = ?,
                     s1_midterm = ?, s1_pre_final = ?, s2_midterm = ?, s2_pre_final = ?,
                     prelim = ?, midterm = ?, final = ?,
                     overall = NULL, overall_is_manual = 0
                 WHERE id = ?",
                (
                    grade_type,
                    comp("q1"),
                    comp("q2"),
                    comp("q3"),
                    comp("q4"),
                    comp("s1Midterm"),
                    comp("s1PreFinal"),
                    comp("s2Midterm"),
                    comp("s2PreFinal"),
                    comp("prelim"),
                    comp("midterm"),
                    comp("final"),
                    &grade_id,
                ),
            );
            match update {
                Ok(_) => ok(&req.id, json!({ "gradeId": grade_id })),
                Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
            }
        }
        None => {
            let grade_id = Uuid::new_v4().to_string();
            let insert = conn.execute(
                "INSERT INTO subject_grades(
                     id, student_id, subject_id, school_year, grade_type,
                     q1, q2, q3, q4, s1_midterm, s1_pre_final, s2_midterm, s2_pre_final,
                     prelim, midterm, final, overall, overall_is_manual, status)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 0, 'draft')",
                (
                    &grade_id,
                    student_id,
                    subject_id,
                    school_year,
                    grade_type.unwrap_or("final"),
                    comp("q1"),
                    comp("q2"),
                    comp("q3"),
                    comp("q4"),
                    comp("s1Midterm"),
                    comp("s1PreFinal"),
                    comp("s2Midterm"),
                    comp("s2PreFinal"),
                    comp("prelim"),
                    comp("midterm"),
                    comp("final"),
                ),
            );
            match insert {
                Ok(_) => ok(&req.id, json!({ "gradeId": grade_id })),
                Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
            }
        }
    }
}

/// Recompute the overall grade from the record's components. Does not touch
/// the status; submission stays a separate explicit action. A manual overall
/// is never silently recomputed away: the caller must pass clearManual.
fn handle_compute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(grade_id) = param_str(req, "gradeId") else {
        return err(&req.id, "bad_params", "missing gradeId", None);
    };
    let clear_manual = param_bool(req, "clearManual").unwrap_or(false);

    let row = match load_grade(conn, grade_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    if row.status == GradeStatus::Finalized {
        return err(
            &req.id,
            "validation_failed",
            "finalized records are frozen",
            None,
        );
    }
    if row.overall_is_manual && !clear_manual {
        return err(
            &req.id,
            "validation_failed",
            "overall was set manually; pass clearManual to recompute over it",
            None,
        );
    }

    let population = match resolve_population(conn, &row.student_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let strategy = population.map(Population::strategy).unwrap_or(Strategy::LegacyFlat);
    let overall = aggregate::overall_grade(population, &row.components);

    let update = conn.execute(
        "UPDATE subject_grades SET overall = ?, overall_is_manual = 0 WHERE id = ?",
        (overall, grade_id),
    );
    if let Err(e) = update {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "gradeId": grade_id,
            "overall": overall,
            "population": population,
            "strategy": strategy,
        }),
    )
}

fn handle_can_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(grade_id) = param_str(req, "gradeId") else {
        return err(&req.id, "bad_params", "missing gradeId", None);
    };
    match load_grade(conn, grade_id) {
        Ok(row) => ok(
            &req.id,
            json!({
                "gradeId": grade_id,
                "canSubmit": workflow::can_submit_grade(row.status, row.overall),
            }),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(grade_id) = param_str(req, "gradeId") else {
        return err(&req.id, "bad_params", "missing gradeId", None);
    };
    let Some(actor_id) = param_str(req, "actorId") else {
        return err(&req.id, "bad_params", "missing actorId", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let row = match load_grade(&tx, grade_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    if let Err(e) = actor_role(&tx, actor_id) {
        return engine_err(&req.id, e);
    }
    if let Err(e) = workflow::guard_grade_submit(row.status, row.overall) {
        return engine_err(&req.id, e);
    }
    if let Err(e) = tx.execute(
        "UPDATE subject_grades SET status = 'submitted', submitted_by = ? WHERE id = ?",
        (actor_id, grade_id),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "gradeId": grade_id, "status": "submitted" }))
}

/// Approve a submitted grade. Role separation is checked inside the updating
/// transaction. Approving a final-type grade then kicks off honor
/// recomputation; that trigger is a separate failure domain whose failure is
/// logged and reported, never rolled into the approval.
fn handle_approve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(grade_id) = param_str(req, "gradeId") else {
        return err(&req.id, "bad_params", "missing gradeId", None);
    };
    let Some(actor_id) = param_str(req, "actorId") else {
        return err(&req.id, "bad_params", "missing actorId", None);
    };

    let (student_id, school_year, grade_type) = {
        let tx = match conn.unchecked_transaction() {
            Ok(tx) => tx,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let row = match load_grade(&tx, grade_id) {
            Ok(v) => v,
            Err(e) => return engine_err(&req.id, e),
        };
        let role = match actor_role(&tx, actor_id) {
            Ok(v) => v,
            Err(e) => return engine_err(&req.id, e),
        };
        if let Err(e) =
            workflow::guard_grade_approve(row.status, actor_id, role, row.submitted_by.as_deref())
        {
            return engine_err(&req.id, e);
        }
        if let Err(e) = tx.execute(
            "UPDATE subject_grades SET status = 'approved', approved_by = ? WHERE id = ?",
            (actor_id, grade_id),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        if let Err(e) = tx.commit() {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        (row.student_id, row.school_year, row.grade_type)
    };

    let mut result = json!({ "gradeId": grade_id, "status": "approved" });
    if grade_type == "final" {
        match honor::recompute_for_student(conn, &student_id, &school_year) {
            Ok(rows) => {
                result["honorRecomputed"] = json!(true);
                result["honors"] = serde_json::to_value(&rows).unwrap_or_else(|_| json!([]));
            }
            Err(e) => {
                warn!(
                    student_id = %student_id,
                    school_year = %school_year,
                    code = %e.code,
                    "honor recomputation failed after grade approval: {}",
                    e.message
                );
                result["honorRecomputed"] = json!(false);
                result["honorError"] = json!(e.code);
            }
        }
    }
    ok(&req.id, result)
}

fn handle_return(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(grade_id) = param_str(req, "gradeId") else {
        return err(&req.id, "bad_params", "missing gradeId", None);
    };
    let Some(actor_id) = param_str(req, "actorId") else {
        return err(&req.id, "bad_params", "missing actorId", None);
    };
    let reason = param_str(req, "reason").unwrap_or("");

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let row = match load_grade(&tx, grade_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    if let Err(e) = actor_role(&tx, actor_id) {
        return engine_err(&req.id, e);
    }
    if let Err(e) = workflow::guard_grade_return(row.status, reason) {
        return engine_err(&req.id, e);
    }
    if let Err(e) = tx.execute(
        "UPDATE subject_grades SET status = 'draft', submitted_by = NULL WHERE id = ?",
        [grade_id],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = db::audit(&tx, actor_id, "grade.return", "subject_grade", grade_id, Some(reason))
    {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "gradeId": grade_id, "status": "draft" }))
}

fn handle_finalize(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(grade_id) = param_str(req, "gradeId") else {
        return err(&req.id, "bad_params", "missing gradeId", None);
    };
    let Some(actor_id) = param_str(req, "actorId") else {
        return err(&req.id, "bad_params", "missing actorId", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let row = match load_grade(&tx, grade_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let role = match actor_role(&tx, actor_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    if !role.can_approve() {
        return err(
            &req.id,
            "role_separation",
            "finalize requires the approval capability",
            None,
        );
    }
    if let Err(e) = workflow::guard_grade_finalize(row.status) {
        return engine_err(&req.id, e);
    }
    if let Err(e) = tx.execute(
        "UPDATE subject_grades SET status = 'finalized' WHERE id = ?",
        [grade_id],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "gradeId": grade_id, "status": "finalized" }))
}

/// Administrative escape hatch: any status back to draft, admin-only, always
/// audited.
fn handle_admin_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(grade_id) = param_str(req, "gradeId") else {
        return err(&req.id, "bad_params", "missing gradeId", None);
    };
    let Some(actor_id) = param_str(req, "actorId") else {
        return err(&req.id, "bad_params", "missing actorId", None);
    };
    let reason = param_str(req, "reason").unwrap_or("");

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let row = match load_grade(&tx, grade_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let role = match actor_role(&tx, actor_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    if let Err(e) = workflow::guard_grade_admin_reset(role, reason) {
        return engine_err(&req.id, e);
    }
    if let Err(e) = tx.execute(
        "UPDATE subject_grades
         SET status = 'draft', submitted_by = NULL, approved_by = NULL
         WHERE id = ?",
        [grade_id],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = db::audit(
        &tx,
        actor_id,
        "grade.admin_reset",
        "subject_grade",
        grade_id,
        Some(reason),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    info!(grade_id = %grade_id, actor_id = %actor_id, from = row.status.as_str(), "grade administratively reset to draft");
    ok(&req.id, json!({ "gradeId": grade_id, "status": "draft" }))
}

/// Manually force the overall grade. Sets the manual flag so a later
/// recompute cannot silently diverge from this value.
fn handle_override_overall(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(grade_id) = param_str(req, "gradeId") else {
        return err(&req.id, "bad_params", "missing gradeId", None);
    };
    let Some(actor_id) = param_str(req, "actorId") else {
        return err(&req.id, "bad_params", "missing actorId", None);
    };
    let Some(value) = param_f64(req, "value") else {
        return err(&req.id, "bad_params", "missing value", None);
    };
    let reason = param_str(req, "reason").unwrap_or("");
    if reason.trim().is_empty() {
        return err(&req.id, "validation_failed", "override requires a reason", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let row = match load_grade(&tx, grade_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    if row.status == GradeStatus::Finalized {
        return err(&req.id, "validation_failed", "finalized records are frozen", None);
    }
    let role = match actor_role(&tx, actor_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    if !role.can_administer() {
        return err(
            &req.id,
            "role_separation",
            "overriding the overall grade requires the admin role",
            None,
        );
    }
    if let Err(e) = tx.execute(
        "UPDATE subject_grades SET overall = ?, overall_is_manual = 1 WHERE id = ?",
        (value, grade_id),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = db::audit(
        &tx,
        actor_id,
        "grade.override_overall",
        "subject_grade",
        grade_id,
        Some(reason),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "gradeId": grade_id, "overall": value, "overallIsManual": true }))
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(grade_id) = param_str(req, "gradeId") else {
        return err(&req.id, "bad_params", "missing gradeId", None);
    };
    match load_grade(conn, grade_id) {
        Ok(row) => ok(&req.id, grade_json(&row)),
        Err(e) => engine_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.upsertComponents" => Some(handle_upsert_components(state, req)),
        "grades.compute" => Some(handle_compute(state, req)),
        "grades.canSubmit" => Some(handle_can_submit(state, req)),
        "grades.submit" => Some(handle_submit(state, req)),
        "grades.approve" => Some(handle_approve(state, req)),
        "grades.return" => Some(handle_return(state, req)),
        "grades.finalize" => Some(handle_finalize(state, req)),
        "grades.adminReset" => Some(handle_admin_reset(state, req)),
        "grades.overrideOverall" => Some(handle_override_overall(state, req)),
        "grades.get" => Some(handle_get(state, req)),
        _ => None,
    }
}
