use crate::honor::ScaleDirection;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{param_bool, param_f64, param_i64, param_str};
use crate::ipc::types::{AppState, Request};
use crate::workflow::StaffRole;
use serde_json::json;
use uuid::Uuid;

fn handle_levels_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = param_str(req, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };
    let scale = param_str(req, "scale").unwrap_or("k12");
    if ScaleDirection::parse(scale).is_none() {
        return err(
            &req.id,
            "bad_params",
            "scale must be one of: k12, collegiate",
            Some(json!({ "scale": scale })),
        );
    }

    let id = Uuid::new_v4().to_string();
    let result = conn.execute(
        "INSERT INTO academic_levels(id, name, scale, year_min, year_max)
         VALUES(?, ?, ?, ?, ?)",
        (
            &id,
            name,
            scale,
            param_i64(req, "yearMin"),
            param_i64(req, "yearMax"),
        ),
    );
    match result {
        Ok(_) => ok(&req.id, json!({ "levelId": id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_honor_types_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = param_str(req, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };
    let Some(tier_rank) = param_i64(req, "tierRank") else {
        return err(&req.id, "bad_params", "missing tierRank", None);
    };

    let id = Uuid::new_v4().to_string();
    let result = conn.execute(
        "INSERT INTO honor_types(id, name, tier_rank) VALUES(?, ?, ?)",
        (&id, name, tier_rank),
    );
    match result {
        Ok(_) => ok(&req.id, json!({ "honorTypeId": id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_staff_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = param_str(req, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };
    let Some(role) = param_str(req, "role") else {
        return err(&req.id, "bad_params", "missing role", None);
    };
    if StaffRole::parse(role).is_none() {
        return err(
            &req.id,
            "bad_params",
            "role must be one of: instructor, approver, admin",
            Some(json!({ "role": role })),
        );
    }

    let id = Uuid::new_v4().to_string();
    let result = conn.execute(
        "INSERT INTO staff(id, name, role) VALUES(?, ?, ?)",
        (&id, name, role),
    );
    match result {
        Ok(_) => ok(&req.id, json!({ "staffId": id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_students_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = param_str(req, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };
    let Some(level_id) = param_str(req, "academicLevelId") else {
        return err(&req.id, "bad_params", "missing academicLevelId", None);
    };

    let id = Uuid::new_v4().to_string();
    let result = conn.execute(
        "INSERT INTO students(id, name, academic_level_id, year_level, college_enrolled)
         VALUES(?, ?, ?, ?, ?)",
        (
            &id,
            name,
            level_id,
            param_i64(req, "yearLevel"),
            param_bool(req, "collegeEnrolled").unwrap_or(false) as i64,
        ),
    );
    match result {
        Ok(_) => ok(&req.id, json!({ "studentId": id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_subjects_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = param_str(req, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };

    let id = Uuid::new_v4().to_string();
    match conn.execute("INSERT INTO subjects(id, name) VALUES(?, ?)", (&id, name)) {
        Ok(_) => ok(&req.id, json!({ "subjectId": id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_sections_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = param_str(req, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };

    let id = Uuid::new_v4().to_string();
    match conn.execute("INSERT INTO sections(id, name) VALUES(?, ?)", (&id, name)) {
        Ok(_) => ok(&req.id, json!({ "sectionId": id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_sections_add_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_id) = param_str(req, "sectionId") else {
        return err(&req.id, "bad_params", "missing sectionId", None);
    };
    let Some(student_id) = param_str(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };

    let result = conn.execute(
        "INSERT OR IGNORE INTO section_students(section_id, student_id) VALUES(?, ?)",
        (section_id, student_id),
    );
    match result {
        Ok(changed) => ok(&req.id, json!({ "added": changed > 0 })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_criteria_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(level_id) = param_str(req, "academicLevelId") else {
        return err(&req.id, "bad_params", "missing academicLevelId", None);
    };
    let Some(honor_type_id) = param_str(req, "honorTypeId") else {
        return err(&req.id, "bad_params", "missing honorTypeId", None);
    };

    let id = Uuid::new_v4().to_string();
    let result = conn.execute(
        "INSERT INTO honor_criteria(
             id, academic_level_id, honor_type_id, min_gpa, max_gpa, min_grade,
             min_grade_all, min_year, max_year, require_consistent_honor)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            level_id,
            honor_type_id,
            param_f64(req, "minGpa"),
            param_f64(req, "maxGpa"),
            param_f64(req, "minGrade"),
            param_f64(req, "minGradeAll"),
            param_i64(req, "minYear"),
            param_i64(req, "maxYear"),
            param_bool(req, "requireConsistentHonor").unwrap_or(false) as i64,
        ),
    );
    match result {
        Ok(_) => ok(&req.id, json!({ "criterionId": id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "levels.add" => Some(handle_levels_add(state, req)),
        "honorTypes.add" => Some(handle_honor_types_add(state, req)),
        "staff.add" => Some(handle_staff_add(state, req)),
        "students.add" => Some(handle_students_add(state, req)),
        "subjects.add" => Some(handle_subjects_add(state, req)),
        "sections.add" => Some(handle_sections_add(state, req)),
        "sections.addStudent" => Some(handle_sections_add_student(state, req)),
        "criteria.add" => Some(handle_criteria_add(state, req)),
        _ => None,
    }
}
