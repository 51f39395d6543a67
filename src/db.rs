use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("registrar.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.busy_timeout(std::time::Duration::from_millis(2000))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_levels(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            scale TEXT NOT NULL DEFAULT 'k12',
            year_min INTEGER,
            year_max INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS honor_types(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            tier_rank INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            role TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            academic_level_id TEXT NOT NULL,
            year_level INTEGER,
            college_enrolled INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(academic_level_id) REFERENCES academic_levels(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_level ON students(academic_level_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS section_students(
            section_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(section_id, student_id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_enrollments(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            school_year TEXT NOT NULL,
            UNIQUE(subject_id, student_id, school_year),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_enrollments_student
         ON subject_enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS period_scores(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            academic_level_id TEXT NOT NULL,
            grading_period TEXT NOT NULL,
            school_year TEXT NOT NULL,
            value REAL,
            status TEXT NOT NULL DEFAULT 'draft',
            entered_by TEXT,
            UNIQUE(student_id, subject_id, grading_period, school_year),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(academic_level_id) REFERENCES academic_levels(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_period_scores_student
         ON period_scores(student_id, school_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            school_year TEXT NOT NULL,
            grade_type TEXT NOT NULL DEFAULT 'final',
            q1 REAL, q2 REAL, q3 REAL, q4 REAL,
            s1_midterm REAL, s1_pre_final REAL,
            s2_midterm REAL, s2_pre_final REAL,
            prelim REAL, midterm REAL, final REAL,
            overall REAL,
            overall_is_manual INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'draft',
            submitted_by TEXT,
            approved_by TEXT,
            UNIQUE(student_id, subject_id, school_year),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    ensure_subject_grades_manual_flag(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_grades_student
         ON subject_grades(student_id, school_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS honor_criteria(
            id TEXT PRIMARY KEY,
            academic_level_id TEXT NOT NULL,
            honor_type_id TEXT NOT NULL,
            min_gpa REAL,
            max_gpa REAL,
            min_grade REAL,
            min_grade_all REAL,
            min_year INTEGER,
            max_year INTEGER,
            require_consistent_honor INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(academic_level_id) REFERENCES academic_levels(id),
            FOREIGN KEY(honor_type_id) REFERENCES honor_types(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_honor_criteria_level
         ON honor_criteria(academic_level_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS honor_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            honor_type_id TEXT NOT NULL,
            academic_level_id TEXT NOT NULL,
            school_year TEXT NOT NULL,
            gpa REAL NOT NULL,
            is_overridden INTEGER NOT NULL DEFAULT 0,
            override_reason TEXT,
            overridden_by TEXT,
            UNIQUE(student_id, honor_type_id, academic_level_id, school_year),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(honor_type_id) REFERENCES honor_types(id),
            FOREIGN KEY(academic_level_id) REFERENCES academic_levels(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_honor_results_student
         ON honor_results(student_id, school_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS certificates(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            template_id TEXT NOT NULL,
            period TEXT NOT NULL,
            certificate_number TEXT NOT NULL UNIQUE,
            upload_status TEXT NOT NULL DEFAULT 'pending',
            is_digitally_signed INTEGER NOT NULL DEFAULT 0,
            print_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE(student_id, template_id, period),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS certificate_sequences(
            year INTEGER NOT NULL,
            month INTEGER NOT NULL,
            next_seq INTEGER NOT NULL,
            PRIMARY KEY(year, month)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log(
            id TEXT PRIMARY KEY,
            at TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            action TEXT NOT NULL,
            entity TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            reason TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_entity ON audit_log(entity, entity_id)",
        [],
    )?;

    // Workspaces created before the status vocabulary settled used 'entered'
    // for freshly keyed period scores.
    migrate_period_score_statuses(&conn)?;

    Ok(conn)
}

/// Record an audited action. Escape hatches and return transitions must
/// always pass a reason; ordinary transitions may pass None.
pub fn audit(
    conn: &Connection,
    actor_id: &str,
    action: &str,
    entity: &str,
    entity_id: &str,
    reason: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audit_log(id, at, actor_id, action, entity, entity_id, reason)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            uuid::Uuid::new_v4().to_string(),
            chrono::Utc::now().to_rfc3339(),
            actor_id,
            action,
            entity,
            entity_id,
            reason,
        ),
    )?;
    Ok(())
}

fn ensure_subject_grades_manual_flag(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "subject_grades", "overall_is_manual")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE subject_grades ADD COLUMN overall_is_manual INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn migrate_period_score_statuses(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE period_scores SET status = 'draft' WHERE status = 'entered'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
