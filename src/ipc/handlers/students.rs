use super::session::{can_access_class, require_session};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, decode_id_list, optional_str, parse_iso_date, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StudentRow {
    id: String,
    name: String,
    roll_number: String,
    class_id: String,
    section: String,
    father_name: String,
    mother_name: String,
    date_of_birth: String,
    address: String,
    phone: String,
    email: Option<String>,
    admission_date: String,
}

impl StudentRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "rollNumber": self.roll_number,
            "classId": self.class_id,
            "section": self.section,
            "fatherName": self.father_name,
            "motherName": self.mother_name,
            "dateOfBirth": self.date_of_birth,
            "address": self.address,
            "phone": self.phone,
            "email": self.email,
            "admissionDate": self.admission_date,
        })
    }
}

const SELECT_STUDENT: &str = "SELECT id, name, roll_number, class_id, section, father_name,
        mother_name, date_of_birth, address, phone, email, admission_date
 FROM students";

fn row_to_student(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok(StudentRow {
        id: r.get(0)?,
        name: r.get(1)?,
        roll_number: r.get(2)?,
        class_id: r.get(3)?,
        section: r.get(4)?,
        father_name: r.get(5)?,
        mother_name: r.get(6)?,
        date_of_birth: r.get(7)?,
        address: r.get(8)?,
        phone: r.get(9)?,
        email: r.get(10)?,
        admission_date: r.get(11)?,
    })
}

pub(crate) fn load_student(
    conn: &Connection,
    req: &Request,
    student_id: &str,
) -> Result<Option<(String, String, String)>, serde_json::Value> {
    // (name, roll_number, class_id) — enough for access checks and joins.
    conn.query_row(
        "SELECT name, roll_number, class_id FROM students WHERE id = ?",
        [student_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
    .optional()
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

fn check_class_and_section(
    conn: &Connection,
    req: &Request,
    class_id: &str,
    section: &str,
) -> Result<(), serde_json::Value> {
    let sections_raw: Option<String> = conn
        .query_row("SELECT sections FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some(sections_raw) = sections_raw else {
        return Err(err(&req.id, "not_found", "class not found", None));
    };
    let sections = decode_id_list(&sections_raw);
    if !sections.is_empty() && !sections.iter().any(|s| s == section) {
        return Err(err(
            &req.id,
            "validation_failed",
            format!("section '{}' is not defined for this class", section),
            Some(json!({ "sections": sections })),
        ));
    }
    Ok(())
}

fn check_unique_roll(
    conn: &Connection,
    req: &Request,
    roll_number: &str,
    exclude_id: Option<&str>,
) -> Result<(), serde_json::Value> {
    let duplicate: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE roll_number = ?",
            [roll_number],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    match duplicate {
        Some(id) if Some(id.as_str()) != exclude_id => Err(err(
            &req.id,
            "validation_failed",
            format!("roll number '{}' is already in use", roll_number),
            None,
        )),
        _ => Ok(()),
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let class_filter = match optional_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section_filter = match optional_str(req, "section") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let search = match optional_str(req, "search") {
        Ok(v) => v.map(|s| s.to_lowercase()),
        Err(e) => return e,
    };

    let sql = format!("{} ORDER BY roll_number", SELECT_STUDENT);
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| row_to_student(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let all = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let students: Vec<serde_json::Value> = all
        .iter()
        .filter(|s| can_access_class(session, &s.class_id))
        .filter(|s| class_filter.as_deref().map(|c| s.class_id == c).unwrap_or(true))
        .filter(|s| {
            section_filter
                .as_deref()
                .map(|sec| s.section == sec)
                .unwrap_or(true)
        })
        .filter(|s| {
            search
                .as_deref()
                .map(|q| {
                    s.name.to_lowercase().contains(q) || s.roll_number.to_lowercase().contains(q)
                })
                .unwrap_or(true)
        })
        .map(|s| s.to_json())
        .collect();

    ok(&req.id, json!({ "students": students }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let required = |key: &str| required_str(req, key);
    let name = match required("name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let roll_number = match required("rollNumber") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required("classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section = match required("section") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let father_name = match required("fatherName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mother_name = match required("motherName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date_of_birth = match required("dateOfBirth") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let address = match required("address") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let phone = match required("phone") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let admission_date = match required("admissionDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match optional_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };

    if !can_access_class(session, &class_id) {
        return err(&req.id, "forbidden", "class is not accessible", None);
    }
    if let Err(e) = check_class_and_section(conn, req, &class_id, &section) {
        return e;
    }
    if let Err(e) = parse_iso_date(req, "dateOfBirth", &date_of_birth) {
        return e;
    }
    if let Err(e) = parse_iso_date(req, "admissionDate", &admission_date) {
        return e;
    }
    if let Err(e) = check_unique_roll(conn, req, &roll_number, None) {
        return e;
    }

    let student = StudentRow {
        id: Uuid::new_v4().to_string(),
        name,
        roll_number,
        class_id,
        section,
        father_name,
        mother_name,
        date_of_birth,
        address,
        phone,
        email,
        admission_date,
    };

    if let Err(e) = conn.execute(
        "INSERT INTO students(id, name, roll_number, class_id, section, father_name,
                              mother_name, date_of_birth, address, phone, email, admission_date)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student.id,
            &student.name,
            &student.roll_number,
            &student.class_id,
            &student.section,
            &student.father_name,
            &student.mother_name,
            &student.date_of_birth,
            &student.address,
            &student.phone,
            &student.email,
            &student.admission_date,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "student": student.to_json() }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let sql = format!("{} WHERE id = ?", SELECT_STUDENT);
    let existing: Option<StudentRow> = match conn
        .query_row(&sql, [&student_id], |r| row_to_student(r))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(old) = existing else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if !can_access_class(session, &old.class_id) {
        return err(&req.id, "forbidden", "class is not accessible", None);
    }

    let mut merged = old.clone();
    let fields: [(&str, &mut String); 8] = [
        ("name", &mut merged.name),
        ("rollNumber", &mut merged.roll_number),
        ("section", &mut merged.section),
        ("fatherName", &mut merged.father_name),
        ("motherName", &mut merged.mother_name),
        ("dateOfBirth", &mut merged.date_of_birth),
        ("address", &mut merged.address),
        ("phone", &mut merged.phone),
    ];
    for (key, slot) in fields {
        match optional_str(req, key) {
            Ok(Some(v)) => *slot = v,
            Ok(None) => {}
            Err(e) => return e,
        }
    }
    match optional_str(req, "classId") {
        Ok(Some(v)) => merged.class_id = v,
        Ok(None) => {}
        Err(e) => return e,
    }
    match optional_str(req, "admissionDate") {
        Ok(Some(v)) => merged.admission_date = v,
        Ok(None) => {}
        Err(e) => return e,
    }
    // email: null clears, absent keeps.
    match req.params.get("email") {
        None => {}
        Some(v) if v.is_null() => merged.email = None,
        Some(v) => match v.as_str() {
            Some(s) => merged.email = Some(s.trim().to_string()),
            None => return err(&req.id, "bad_params", "email must be a string", None),
        },
    }

    // A class move must be legal on both sides of the move.
    if merged.class_id != old.class_id && !can_access_class(session, &merged.class_id) {
        return err(&req.id, "forbidden", "target class is not accessible", None);
    }
    if let Err(e) = check_class_and_section(conn, req, &merged.class_id, &merged.section) {
        return e;
    }
    if let Err(e) = parse_iso_date(req, "dateOfBirth", &merged.date_of_birth) {
        return e;
    }
    if let Err(e) = parse_iso_date(req, "admissionDate", &merged.admission_date) {
        return e;
    }
    if let Err(e) = check_unique_roll(conn, req, &merged.roll_number, Some(&student_id)) {
        return e;
    }

    if let Err(e) = conn.execute(
        "UPDATE students SET name = ?, roll_number = ?, class_id = ?, section = ?,
                father_name = ?, mother_name = ?, date_of_birth = ?, address = ?,
                phone = ?, email = ?, admission_date = ?
         WHERE id = ?",
        (
            &merged.name,
            &merged.roll_number,
            &merged.class_id,
            &merged.section,
            &merged.father_name,
            &merged.mother_name,
            &merged.date_of_birth,
            &merged.address,
            &merged.phone,
            &merged.email,
            &merged.admission_date,
            &student_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "student": merged.to_json() }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let found = match load_student(conn, req, &student_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some((_, _, class_id)) = found else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if !can_access_class(session, &class_id) {
        return err(&req.id, "forbidden", "class is not accessible", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Grades cascade with their student (no ON DELETE CASCADE).
    if let Err(e) = tx.execute("DELETE FROM grades WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
