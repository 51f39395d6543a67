use chrono::{Datelike, NaiveDateTime};
use rusqlite::Connection;

use crate::aggregate::EngineError;

const SEQUENCE_MAX_ATTEMPTS: u32 = 5;

/// Draw the next certificate number for the (year, month) scope of
/// `created_at`: `CERT-{yyyy}{mm}-{n}`, n 1-based per scope.
///
/// The draw is a single atomic upsert-returning against the counter row, so
/// concurrent creators can never observe the same value; a read-count-then-
/// insert pattern would race. Busy/locked conflicts are retried a bounded
/// number of times, then surfaced as a `conflict` error.
pub fn next_certificate_number(
    conn: &Connection,
    created_at: NaiveDateTime,
) -> Result<String, EngineError> {
    let year = created_at.year();
    let month = created_at.month();

    let mut attempt = 0;
    loop {
        attempt += 1;
        let drawn: Result<i64, rusqlite::Error> = conn.query_row(
            "INSERT INTO certificate_sequences(year, month, next_seq)
             VALUES(?, ?, 1)
             ON CONFLICT(year, month) DO UPDATE SET next_seq = next_seq + 1
             RETURNING next_seq",
            (year, month),
            |r| r.get(0),
        );
        match drawn {
            Ok(seq) => return Ok(format_certificate_number(year, month, seq)),
            Err(e) if is_busy(&e) && attempt < SEQUENCE_MAX_ATTEMPTS => continue,
            Err(e) if is_busy(&e) => {
                return Err(EngineError::new(
                    "conflict",
                    format!(
                        "certificate sequence draw failed after {} attempts: {}",
                        attempt, e
                    ),
                ))
            }
            Err(e) => return Err(EngineError::db(e)),
        }
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

pub fn format_certificate_number(year: i32, month: u32, seq: i64) -> String {
    format!("CERT-{}{:02}-{}", year, month, seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute(
            "CREATE TABLE certificate_sequences(
                year INTEGER NOT NULL,
                month INTEGER NOT NULL,
                next_seq INTEGER NOT NULL,
                PRIMARY KEY(year, month)
            )",
            [],
        )
        .expect("create sequence table");
        conn
    }

    fn at(year: i32, month: u32, day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(year, month, day)
            .expect("valid date")
            .and_hms_opt(9, 30, 0)
            .expect("valid time")
    }

    #[test]
    fn sequence_is_one_based_and_gapless_in_a_single_writer_trace() {
        let conn = test_conn();
        let when = at(2026, 3, 5);
        assert_eq!(
            next_certificate_number(&conn, when).expect("draw"),
            "CERT-202603-1"
        );
        assert_eq!(
            next_certificate_number(&conn, when).expect("draw"),
            "CERT-202603-2"
        );
        assert_eq!(
            next_certificate_number(&conn, when).expect("draw"),
            "CERT-202603-3"
        );
    }

    #[test]
    fn scope_resets_across_year_month_boundaries() {
        let conn = test_conn();
        assert_eq!(
            next_certificate_number(&conn, at(2026, 3, 28)).expect("draw"),
            "CERT-202603-1"
        );
        assert_eq!(
            next_certificate_number(&conn, at(2026, 4, 1)).expect("draw"),
            "CERT-202604-1"
        );
        assert_eq!(
            next_certificate_number(&conn, at(2027, 3, 1)).expect("draw"),
            "CERT-202703-1"
        );
        // Back in the original scope, the counter continues.
        assert_eq!(
            next_certificate_number(&conn, at(2026, 3, 30)).expect("draw"),
            "CERT-202603-2"
        );
    }

    #[test]
    fn month_is_zero_padded() {
        assert_eq!(format_certificate_number(2026, 1, 12), "CERT-202601-12");
        assert_eq!(format_certificate_number(2026, 11, 3), "CERT-202611-3");
    }
}
