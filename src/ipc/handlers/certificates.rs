use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::param_str;
use crate::ipc::types::{AppState, Request};
use crate::sequence;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const UPLOAD_STATUSES: [&str; 4] = ["pending", "uploaded", "rejected", "approved"];

fn parse_created_at(raw: Option<&str>) -> Result<NaiveDateTime, String> {
    let Some(raw) = raw else {
        return Ok(Utc::now().naive_utc());
    };
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt);
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Ok(dt);
        }
    }
    Err(format!("unparseable createdAt: {}", raw))
}

fn certificate_json(conn: &Connection, id: &str) -> Result<serde_json::Value, rusqlite::Error> {
    conn.query_row(
        "SELECT id, student_id, template_id, period, certificate_number,
                upload_status, is_digitally_signed, print_count, created_at
         FROM certificates WHERE id = ?",
        [id],
        |r| {
            Ok(json!({
                "certificateId": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "templateId": r.get::<_, String>(2)?,
                "period": r.get::<_, String>(3)?,
                "certificateNumber": r.get::<_, String>(4)?,
                "uploadStatus": r.get::<_, String>(5)?,
                "isDigitallySigned": r.get::<_, i64>(6)? != 0,
                "printCount": r.get::<_, i64>(7)?,
                "createdAt": r.get::<_, String>(8)?,
            }))
        },
    )
}

/// Create a certificate record, assigning its number exactly once. A repeat
/// call for the same (student, template, period) returns the existing record
/// untouched; the number is never redrawn.
fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = param_str(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(template_id) = param_str(req, "templateId") else {
        return err(&req.id, "bad_params", "missing templateId", None);
    };
    let Some(period) = param_str(req, "period") else {
        return err(&req.id, "bad_params", "missing period", None);
    };
    let created_at = match parse_created_at(param_str(req, "createdAt")) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let existing: Option<String> = match tx
        .query_row(
            "SELECT id FROM certificates
             WHERE student_id = ? AND template_id = ? AND period = ?",
            (student_id, template_id, period),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(cert_id) = existing {
        // Idempotent no-op; the sequence is only consumed on first creation.
        drop(tx);
        return match certificate_json(conn, &cert_id) {
            Ok(mut v) => {
                v["created"] = json!(false);
                ok(&req.id, v)
            }
            Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
        };
    }

    let number = match sequence::next_certificate_number(&tx, created_at) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let cert_id = Uuid::new_v4().to_string();
    let insert = tx.execute(
        "INSERT INTO certificates(
             id, student_id, template_id, period, certificate_number,
             upload_status, is_digitally_signed, print_count, created_at)
         VALUES(?, ?, ?, ?, ?, 'pending', 0, 0, ?)",
        (
            &cert_id,
            student_id,
            template_id,
            period,
            &number,
            created_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
        ),
    );
    if let Err(e) = insert {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    match certificate_json(conn, &cert_id) {
        Ok(mut v) => {
            v["created"] = json!(true);
            ok(&req.id, v)
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(cert_id) = param_str(req, "certificateId") else {
        return err(&req.id, "bad_params", "missing certificateId", None);
    };
    match certificate_json(conn, cert_id) {
        Ok(v) => ok(&req.id, v),
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            err(&req.id, "not_found", "certificate not found", None)
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_set_upload_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(cert_id) = param_str(req, "certificateId") else {
        return err(&req.id, "bad_params", "missing certificateId", None);
    };
    let Some(status) = param_str(req, "uploadStatus") else {
        return err(&req.id, "bad_params", "missing uploadStatus", None);
    };
    if !UPLOAD_STATUSES.contains(&status) {
        return err(
            &req.id,
            "bad_params",
            "uploadStatus must be one of: pending, uploaded, rejected, approved",
            Some(json!({ "uploadStatus": status })),
        );
    }

    match conn.execute(
        "UPDATE certificates SET upload_status = ? WHERE id = ?",
        (status, cert_id),
    ) {
        Ok(0) => err(&req.id, "not_found", "certificate not found", None),
        Ok(_) => ok(&req.id, json!({ "certificateId": cert_id, "uploadStatus": status })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_record_print(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(cert_id) = param_str(req, "certificateId") else {
        return err(&req.id, "bad_params", "missing certificateId", None);
    };

    let count: Result<i64, rusqlite::Error> = conn.query_row(
        "UPDATE certificates SET print_count = print_count + 1 WHERE id = ?
         RETURNING print_count",
        [cert_id],
        |r| r.get(0),
    );
    match count {
        Ok(n) => ok(&req.id, json!({ "certificateId": cert_id, "printCount": n })),
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            err(&req.id, "not_found", "certificate not found", None)
        }
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_sign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(cert_id) = param_str(req, "certificateId") else {
        return err(&req.id, "bad_params", "missing certificateId", None);
    };

    match conn.execute(
        "UPDATE certificates SET is_digitally_signed = 1 WHERE id = ?",
        [cert_id],
    ) {
        Ok(0) => err(&req.id, "not_found", "certificate not found", None),
        Ok(_) => ok(&req.id, json!({ "certificateId": cert_id, "isDigitallySigned": true })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "certificates.create" => Some(handle_create(state, req)),
        "certificates.get" => Some(handle_get(state, req)),
        "certificates.setUploadStatus" => Some(handle_set_upload_status(state, req)),
        "certificates.recordPrint" => Some(handle_record_print(state, req)),
        "certificates.sign" => Some(handle_sign(state, req)),
        _ => None,
    }
}
