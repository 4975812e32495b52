use super::session::{can_access_class, require_session};
use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, decode_id_list, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const SCHOOL_NAME: &str = "J. R. PREPARATORY SCHOOL";
const SCHOOL_TAGLINE: &str = "Academic Excellence Through Innovation";
const SCHOOL_CONTACT: &str = "Phone: +92-21-1234567 | Email: info@jrprep.edu.pk";

#[derive(Debug, Clone)]
struct ReportStudent {
    id: String,
    name: String,
    roll_number: String,
    class_id: String,
    class_name: String,
    section: String,
    father_name: String,
    mother_name: String,
    date_of_birth: String,
    phone: String,
}

fn load_report_student(
    conn: &Connection,
    req: &Request,
    student_id: &str,
) -> Result<Option<ReportStudent>, serde_json::Value> {
    conn.query_row(
        "SELECT s.id, s.name, s.roll_number, s.class_id, c.name, s.section,
                s.father_name, s.mother_name, s.date_of_birth, s.phone
         FROM students s
         JOIN classes c ON c.id = s.class_id
         WHERE s.id = ?",
        [student_id],
        |r| {
            Ok(ReportStudent {
                id: r.get(0)?,
                name: r.get(1)?,
                roll_number: r.get(2)?,
                class_id: r.get(3)?,
                class_name: r.get(4)?,
                section: r.get(5)?,
                father_name: r.get(6)?,
                mother_name: r.get(7)?,
                date_of_birth: r.get(8)?,
                phone: r.get(9)?,
            })
        },
    )
    .optional()
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

pub(crate) fn load_subject_rows(
    conn: &Connection,
    req: &Request,
) -> Result<Vec<calc::SubjectRow>, serde_json::Value> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, code, max_marks, passing_marks, class_ids
             FROM subjects
             ORDER BY name",
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    stmt.query_map([], |r| {
        let class_ids: String = r.get(5)?;
        Ok(calc::SubjectRow {
            id: r.get(0)?,
            name: r.get(1)?,
            code: r.get(2)?,
            max_marks: r.get(3)?,
            passing_marks: r.get(4)?,
            class_ids: decode_id_list(&class_ids),
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

fn load_student_grade_rows(
    conn: &Connection,
    req: &Request,
    student_id: &str,
    academic_year: &str,
) -> Result<Vec<calc::GradeRow>, serde_json::Value> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, subject_id, marks_obtained, exam_type, term, academic_year
             FROM grades
             WHERE student_id = ? AND academic_year = ?",
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let rows = stmt
        .query_map([student_id, academic_year], |r| {
            let student_id: String = r.get(0)?;
            let subject_id: String = r.get(1)?;
            let marks: f64 = r.get(2)?;
            let exam_type: String = r.get(3)?;
            let term: Option<i64> = r.get(4)?;
            let academic_year: String = r.get(5)?;
            Ok((student_id, subject_id, marks, exam_type, term, academic_year))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    Ok(rows
        .into_iter()
        .filter_map(|(student_id, subject_id, marks, exam_type, term, academic_year)| {
            calc::ExamKind::parse(&exam_type).map(|exam_kind| calc::GradeRow {
                student_id,
                subject_id,
                marks_obtained: marks,
                exam_kind,
                term,
                academic_year,
            })
        })
        .collect())
}

fn parse_mode(req: &Request) -> Result<calc::ReportMode, serde_json::Value> {
    let raw = required_str(req, "resultType")?;
    calc::ReportMode::parse(&raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            "resultType must be half-yearly or full-yearly",
            None,
        )
    })
}

fn document_columns(mode: calc::ReportMode) -> Vec<&'static str> {
    match mode {
        calc::ReportMode::HalfYearly => {
            vec!["Subject", "Term 1 Assign", "Half Yearly", "Total", "Grade"]
        }
        calc::ReportMode::FullYearly => vec![
            "Subject",
            "Assignments",
            "Half Yearly",
            "Final",
            "Total",
            "Grade",
        ],
    }
}

fn document_rows(report: &calc::StudentReport, mode: calc::ReportMode) -> Vec<serde_json::Value> {
    report
        .subjects
        .iter()
        .map(|line| {
            let line_pct = calc::percentage(line.obtained, line.total_possible);
            let grade = calc::letter_grade(line_pct);
            match mode {
                calc::ReportMode::HalfYearly => json!({
                    "subject": line.subject_name,
                    "term1Assignments": line.term1_assignment_marks,
                    "halfYearly": line.half_yearly_marks,
                    "total": line.obtained,
                    "outOf": line.total_possible,
                    "grade": grade,
                }),
                calc::ReportMode::FullYearly => json!({
                    "subject": line.subject_name,
                    "assignments": line.term1_assignment_marks + line.term2_assignment_marks,
                    "halfYearly": line.half_yearly_marks,
                    "final": line.final_marks,
                    "total": line.obtained,
                    "outOf": line.total_possible,
                    "grade": grade,
                }),
            }
        })
        .collect()
}

fn report_payload(
    student: &ReportStudent,
    report: &calc::StudentReport,
    mode: calc::ReportMode,
    academic_year: &str,
) -> serde_json::Value {
    let title = match mode {
        calc::ReportMode::HalfYearly => "HALF YEARLY RESULT",
        calc::ReportMode::FullYearly => "ANNUAL RESULT",
    };
    let file_name = format!(
        "{}_{}_{}_{}.pdf",
        student.name,
        student.roll_number,
        mode.artifact_tag(),
        academic_year
    );

    json!({
        "student": {
            "id": student.id,
            "name": student.name,
            "rollNumber": student.roll_number,
            "classId": student.class_id,
            "className": student.class_name,
            "section": student.section,
            "fatherName": student.father_name,
            "motherName": student.mother_name,
            "dateOfBirth": student.date_of_birth,
            "phone": student.phone,
        },
        "result": serde_json::to_value(report).unwrap_or_default(),
        "document": {
            "letterhead": {
                "schoolName": SCHOOL_NAME,
                "tagline": SCHOOL_TAGLINE,
                "contact": SCHOOL_CONTACT,
            },
            "title": title,
            "academicYear": academic_year,
            "columns": document_columns(mode),
            "rows": document_rows(report, mode),
            "summary": {
                "totalMarks": report.total_marks,
                "obtainedMarks": report.obtained_marks,
                "percentage": calc::round1(report.percentage),
                "grade": report.grade,
                "status": report.status,
            },
            "fileName": file_name,
        },
    })
}

fn handle_reports_student(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let academic_year = match required_str(req, "academicYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mode = match parse_mode(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student = match load_report_student(conn, req, &student_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(student) = student else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if !can_access_class(session, &student.class_id) {
        return err(&req.id, "forbidden", "class is not accessible", None);
    }

    let subjects = match load_subject_rows(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grades = match load_student_grade_rows(conn, req, &student.id, &academic_year) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let report = calc::aggregate_student(
        &student.id,
        &student.class_id,
        &grades,
        &subjects,
        &academic_year,
        mode,
    );
    ok(
        &req.id,
        json!({ "report": report_payload(&student, &report, mode, &academic_year) }),
    )
}

fn handle_reports_bulk(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year = match required_str(req, "academicYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mode = match parse_mode(req) {
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

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.name, s.roll_number, s.class_id, c.name, s.section,
                s.father_name, s.mother_name, s.date_of_birth, s.phone
         FROM students s
         JOIN classes c ON c.id = s.class_id
         ORDER BY s.roll_number",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = stmt
        .query_map([], |r| {
            Ok(ReportStudent {
                id: r.get(0)?,
                name: r.get(1)?,
                roll_number: r.get(2)?,
                class_id: r.get(3)?,
                class_name: r.get(4)?,
                section: r.get(5)?,
                father_name: r.get(6)?,
                mother_name: r.get(7)?,
                date_of_birth: r.get(8)?,
                phone: r.get(9)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let students = match students {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let subjects = match load_subject_rows(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut reports: Vec<serde_json::Value> = Vec::new();
    for student in students
        .iter()
        .filter(|s| can_access_class(session, &s.class_id))
        .filter(|s| class_filter.as_deref().map(|c| s.class_id == c).unwrap_or(true))
        .filter(|s| {
            section_filter
                .as_deref()
                .map(|sec| s.section == sec)
                .unwrap_or(true)
        })
    {
        let grades = match load_student_grade_rows(conn, req, &student.id, &academic_year) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let report = calc::aggregate_student(
            &student.id,
            &student.class_id,
            &grades,
            &subjects,
            &academic_year,
            mode,
        );
        reports.push(report_payload(student, &report, mode, &academic_year));
    }

    ok(&req.id, json!({ "reports": reports }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.student" => Some(handle_reports_student(state, req)),
        "reports.bulk" => Some(handle_reports_bulk(state, req)),
        _ => None,
    }
}
