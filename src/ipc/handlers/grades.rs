use super::session::{can_access_class, require_session};
use super::students::load_student;
use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, decode_id_list, optional_str, parse_iso_date, required_f64, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn grade_json(
    id: &str,
    student_id: &str,
    subject_id: &str,
    marks_obtained: f64,
    exam_type: &str,
    term: Option<i64>,
    exam_date: &str,
    academic_year: &str,
    remarks: Option<&str>,
) -> serde_json::Value {
    json!({
        "id": id,
        "studentId": student_id,
        "subjectId": subject_id,
        "marksObtained": marks_obtained,
        "examType": exam_type,
        "term": term,
        "examDate": exam_date,
        "academicYear": academic_year,
        "remarks": remarks,
    })
}

fn load_subject(
    conn: &Connection,
    req: &Request,
    subject_id: &str,
) -> Result<Option<(f64, Vec<String>)>, serde_json::Value> {
    // (max_marks, class_ids)
    conn.query_row(
        "SELECT max_marks, class_ids FROM subjects WHERE id = ?",
        [subject_id],
        |r| {
            let max: f64 = r.get(0)?;
            let classes: String = r.get(1)?;
            Ok((max, classes))
        },
    )
    .optional()
    .map(|row| row.map(|(max, classes)| (max, decode_id_list(&classes))))
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

fn check_marks_bounds(
    req: &Request,
    kind: calc::ExamKind,
    marks: f64,
    subject_max: f64,
) -> Result<(), serde_json::Value> {
    let cap = match kind {
        calc::ExamKind::Assignment => calc::ASSIGNMENT_OUT_OF,
        _ => subject_max,
    };
    if marks < 0.0 || marks > cap {
        return Err(err(
            &req.id,
            "validation_failed",
            format!("marksObtained must be between 0 and {}", cap),
            Some(json!({ "marksObtained": marks })),
        ));
    }
    Ok(())
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student_filter = match optional_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_filter = match optional_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year_filter = match optional_str(req, "academicYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let type_filter = match optional_str(req, "examType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(t) = type_filter.as_deref() {
        if calc::ExamKind::parse(t).is_none() {
            return err(
                &req.id,
                "bad_params",
                "examType must be one of: assignment, half-yearly, final",
                None,
            );
        }
    }

    let mut stmt = match conn.prepare(
        "SELECT g.id, g.student_id, g.subject_id, g.marks_obtained, g.exam_type,
                g.term, g.exam_date, g.academic_year, g.remarks, s.class_id
         FROM grades g
         JOIN students s ON s.id = g.student_id
         ORDER BY g.exam_date, g.id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let subject_id: String = r.get(2)?;
            let marks: f64 = r.get(3)?;
            let exam_type: String = r.get(4)?;
            let term: Option<i64> = r.get(5)?;
            let exam_date: String = r.get(6)?;
            let academic_year: String = r.get(7)?;
            let remarks: Option<String> = r.get(8)?;
            let class_id: String = r.get(9)?;
            Ok((
                id,
                student_id,
                subject_id,
                marks,
                exam_type,
                term,
                exam_date,
                academic_year,
                remarks,
                class_id,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let all = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let grades: Vec<serde_json::Value> = all
        .iter()
        .filter(|row| can_access_class(session, &row.9))
        .filter(|row| student_filter.as_deref().map(|f| row.1 == f).unwrap_or(true))
        .filter(|row| subject_filter.as_deref().map(|f| row.2 == f).unwrap_or(true))
        .filter(|row| year_filter.as_deref().map(|f| row.7 == f).unwrap_or(true))
        .filter(|row| type_filter.as_deref().map(|f| row.4 == f).unwrap_or(true))
        .map(|row| {
            grade_json(
                &row.0,
                &row.1,
                &row.2,
                row.3,
                &row.4,
                row.5,
                &row.6,
                &row.7,
                row.8.as_deref(),
            )
        })
        .collect();

    ok(&req.id, json!({ "grades": grades }))
}

fn handle_grades_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let marks = match required_f64(req, "marksObtained") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_type_raw = match required_str(req, "examType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_date = match required_str(req, "examDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year = match required_str(req, "academicYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let remarks = match optional_str(req, "remarks") {
        Ok(v) => v.filter(|s| !s.is_empty()),
        Err(e) => return e,
    };

    let Some(kind) = calc::ExamKind::parse(&exam_type_raw) else {
        return err(
            &req.id,
            "bad_params",
            "examType must be one of: assignment, half-yearly, final",
            None,
        );
    };

    // Term is meaningful only for assignments, and then it is mandatory.
    let term: Option<i64> = match (kind, req.params.get("term")) {
        (calc::ExamKind::Assignment, Some(v)) => match v.as_i64() {
            Some(t @ (1 | 2)) => Some(t),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "term must be 1 or 2 for assignments",
                    None,
                )
            }
        },
        (calc::ExamKind::Assignment, None) => {
            return err(
                &req.id,
                "bad_params",
                "term must be 1 or 2 for assignments",
                None,
            )
        }
        (_, None) => None,
        (_, Some(v)) if v.is_null() => None,
        (_, Some(_)) => {
            return err(
                &req.id,
                "bad_params",
                "term only applies to assignment grades",
                None,
            )
        }
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

    let subject = match load_subject(conn, req, &subject_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some((subject_max, subject_classes)) = subject else {
        return err(&req.id, "not_found", "subject not found", None);
    };
    if !subject_classes.iter().any(|c| c == &class_id) {
        return err(
            &req.id,
            "validation_failed",
            "subject is not taught in the student's class",
            None,
        );
    }

    if let Err(e) = check_marks_bounds(req, kind, marks, subject_max) {
        return e;
    }
    if let Err(e) = parse_iso_date(req, "examDate", &exam_date) {
        return e;
    }

    let mut remarks = remarks;
    if kind == calc::ExamKind::Assignment {
        let term_no = term.unwrap_or(1);
        let existing: i64 = match conn.query_row(
            "SELECT COUNT(*) FROM grades
             WHERE student_id = ? AND subject_id = ? AND academic_year = ?
               AND exam_type = 'assignment' AND term = ?",
            (&student_id, &subject_id, &academic_year, term_no),
            |r| r.get(0),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if existing >= calc::ASSIGNMENTS_PER_TERM {
            return err(
                &req.id,
                "validation_failed",
                format!(
                    "maximum {} assignments per term already entered",
                    calc::ASSIGNMENTS_PER_TERM
                ),
                Some(json!({ "term": term_no, "existing": existing })),
            );
        }
        if remarks.is_none() {
            remarks = Some(format!("Term {} Assignment {}", term_no, existing + 1));
        }
    } else {
        // One half-yearly / final entry per subject and year.
        let existing: i64 = match conn.query_row(
            "SELECT COUNT(*) FROM grades
             WHERE student_id = ? AND subject_id = ? AND academic_year = ? AND exam_type = ?",
            (&student_id, &subject_id, &academic_year, kind.as_str()),
            |r| r.get(0),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if existing > 0 {
            return err(
                &req.id,
                "validation_failed",
                format!("a {} grade is already recorded for this subject", kind.as_str()),
                None,
            );
        }
    }

    let grade_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO grades(id, student_id, subject_id, marks_obtained, exam_type, term,
                            exam_date, academic_year, remarks)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            &student_id,
            &subject_id,
            marks,
            kind.as_str(),
            term,
            &exam_date,
            &academic_year,
            &remarks,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    ok(
        &req.id,
        json!({
            "grade": grade_json(
                &grade_id,
                &student_id,
                &subject_id,
                marks,
                kind.as_str(),
                term,
                &exam_date,
                &academic_year,
                remarks.as_deref(),
            )
        }),
    )
}

fn handle_grades_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing: Option<(String, String, f64, String, Option<i64>, String, String, Option<String>)> =
        match conn
            .query_row(
                "SELECT student_id, subject_id, marks_obtained, exam_type, term,
                        exam_date, academic_year, remarks
                 FROM grades WHERE id = ?",
                [&grade_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                        r.get(7)?,
                    ))
                },
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    let Some((student_id, subject_id, old_marks, exam_type, term, old_date, academic_year, old_remarks)) =
        existing
    else {
        return err(&req.id, "not_found", "grade not found", None);
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

    let kind = match calc::ExamKind::parse(&exam_type) {
        Some(k) => k,
        None => {
            return err(
                &req.id,
                "db_query_failed",
                format!("unknown exam type stored: {}", exam_type),
                None,
            )
        }
    };

    let marks = match req.params.get("marksObtained") {
        None => old_marks,
        Some(v) => match v.as_f64() {
            Some(n) => n,
            None => {
                return err(&req.id, "bad_params", "marksObtained must be a number", None)
            }
        },
    };
    let exam_date = match optional_str(req, "examDate") {
        Ok(v) => v.unwrap_or(old_date),
        Err(e) => return e,
    };
    let remarks = match req.params.get("remarks") {
        None => old_remarks,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) => Some(s.to_string()),
            None => return err(&req.id, "bad_params", "remarks must be a string", None),
        },
    };

    let subject = match load_subject(conn, req, &subject_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some((subject_max, _)) = subject else {
        return err(&req.id, "not_found", "subject not found", None);
    };
    if let Err(e) = check_marks_bounds(req, kind, marks, subject_max) {
        return e;
    }
    if let Err(e) = parse_iso_date(req, "examDate", &exam_date) {
        return e;
    }

    if let Err(e) = conn.execute(
        "UPDATE grades SET marks_obtained = ?, exam_date = ?, remarks = ? WHERE id = ?",
        (marks, &exam_date, &remarks, &grade_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    ok(
        &req.id,
        json!({
            "grade": grade_json(
                &grade_id,
                &student_id,
                &subject_id,
                marks,
                &exam_type,
                term,
                &exam_date,
                &academic_year,
                remarks.as_deref(),
            )
        }),
    )
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let class_id: Option<String> = match conn
        .query_row(
            "SELECT s.class_id FROM grades g JOIN students s ON s.id = g.student_id
             WHERE g.id = ?",
            [&grade_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_id) = class_id else {
        return err(&req.id, "not_found", "grade not found", None);
    };
    if !can_access_class(session, &class_id) {
        return err(&req.id, "forbidden", "class is not accessible", None);
    }

    if let Err(e) = conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.create" => Some(handle_grades_create(state, req)),
        "grades.update" => Some(handle_grades_update(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        _ => None,
    }
}
