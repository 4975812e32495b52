use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::path::Path;
use uuid::Uuid;

pub fn password_digest(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("results.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_sha256 TEXT NOT NULL,
            role TEXT NOT NULL,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            assigned_classes TEXT NOT NULL DEFAULT '[]',
            access_id TEXT,
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sections TEXT NOT NULL DEFAULT '[]',
            assigned_teacher TEXT,
            FOREIGN KEY(assigned_teacher) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL,
            max_marks REAL NOT NULL,
            passing_marks REAL NOT NULL,
            class_ids TEXT NOT NULL DEFAULT '[]'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            roll_number TEXT NOT NULL,
            class_id TEXT NOT NULL,
            section TEXT NOT NULL,
            father_name TEXT NOT NULL,
            mother_name TEXT NOT NULL,
            date_of_birth TEXT NOT NULL,
            address TEXT NOT NULL,
            phone TEXT NOT NULL,
            email TEXT,
            admission_date TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_students_roll ON students(roll_number)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            marks_obtained REAL NOT NULL,
            exam_type TEXT NOT NULL,
            term INTEGER,
            exam_date TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            remarks TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    ensure_grades_term(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_subject ON grades(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student_year ON grades(student_id, academic_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS announcements(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            priority TEXT NOT NULL,
            created_by TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT,
            FOREIGN KEY(created_by) REFERENCES users(id)
        )",
        [],
    )?;

    // Older workspaces encoded assignment terms inside free-text remarks.
    // Recover them into the structured term column once.
    migrate_grade_terms(&conn)?;

    seed_default_admin(&conn)?;

    Ok(conn)
}

fn ensure_grades_term(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grades", "term")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE grades ADD COLUMN term INTEGER", [])?;
    Ok(())
}

fn migrate_grade_terms(conn: &Connection) -> anyhow::Result<()> {
    // Legacy rows carried "Term 1 Assignment n" / "Term 2 Assignment n"
    // remark text as the only term discriminator. The substring match is
    // exact and case-sensitive, same as the old writer.
    conn.execute(
        "UPDATE grades SET term = 1
         WHERE exam_type = 'assignment' AND term IS NULL
           AND remarks IS NOT NULL AND instr(remarks, 'Term 1') > 0",
        [],
    )?;
    conn.execute(
        "UPDATE grades SET term = 2
         WHERE exam_type = 'assignment' AND term IS NULL
           AND remarks IS NOT NULL AND instr(remarks, 'Term 2') > 0",
        [],
    )?;
    Ok(())
}

fn seed_default_admin(conn: &Connection) -> anyhow::Result<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
    if count > 0 {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO users(id, username, password_sha256, role, name, email, assigned_classes, access_id, created_at)
         VALUES(?, 'admin', ?, 'admin', 'School Administrator', 'admin@school.local', '[]', NULL, ?)",
        (
            Uuid::new_v4().to_string(),
            password_digest("admin123"),
            chrono::Utc::now().to_rfc3339(),
        ),
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
