use super::session::{can_access_class, require_session};
use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct AnalyticsGradeRow {
    subject_id: String,
    class_id: String,
    marks_obtained: f64,
    exam_kind: calc::ExamKind,
}

#[derive(Debug, Clone)]
struct SubjectMeta {
    name: String,
    max_marks: f64,
    passing_marks: f64,
}

fn mean(sum: f64, count: usize) -> f64 {
    if count > 0 {
        sum / count as f64
    } else {
        0.0
    }
}

fn rate(passed: usize, total: usize) -> f64 {
    if total > 0 {
        100.0 * passed as f64 / total as f64
    } else {
        0.0
    }
}

fn handle_analytics_overview(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let class_filter = match optional_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(class_id) = class_filter.as_deref() {
        if !can_access_class(session, class_id) {
            return err(&req.id, "forbidden", "class is not accessible", None);
        }
    }

    // Accessible classes first; every figure below is computed inside that
    // boundary, never filtered after the fact.
    let mut stmt = match conn.prepare("SELECT id, name FROM classes ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let classes = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            Ok((id, name))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let classes: Vec<(String, String)> = match classes {
        Ok(v) => v
            .into_iter()
            .filter(|(id, _)| can_access_class(session, id))
            .filter(|(id, _)| class_filter.as_deref().map(|c| id == c).unwrap_or(true))
            .collect(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare("SELECT id, class_id FROM students") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let class_id: String = r.get(1)?;
            Ok((id, class_id))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let students: Vec<(String, String)> = match students {
        Ok(v) => v
            .into_iter()
            .filter(|(_, class_id)| can_access_class(session, class_id))
            .filter(|(_, class_id)| {
                class_filter.as_deref().map(|c| class_id == c).unwrap_or(true)
            })
            .collect(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, max_marks, passing_marks FROM subjects ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subjects = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            Ok((
                id,
                SubjectMeta {
                    name: r.get(1)?,
                    max_marks: r.get(2)?,
                    passing_marks: r.get(3)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let subject_list: Vec<(String, SubjectMeta)> = match subjects {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subject_by_id: HashMap<&str, &SubjectMeta> = subject_list
        .iter()
        .map(|(id, meta)| (id.as_str(), meta))
        .collect();

    let mut stmt = match conn.prepare(
        "SELECT g.subject_id, s.class_id, g.marks_obtained, g.exam_type
         FROM grades g
         JOIN students s ON s.id = g.student_id
         WHERE g.academic_year = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&academic_year], |r| {
            let subject_id: String = r.get(0)?;
            let class_id: String = r.get(1)?;
            let marks: f64 = r.get(2)?;
            let exam_type: String = r.get(3)?;
            Ok((subject_id, class_id, marks, exam_type))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let grades: Vec<AnalyticsGradeRow> = match rows {
        Ok(v) => v
            .into_iter()
            .filter(|(_, class_id, _, _)| can_access_class(session, class_id))
            .filter(|(_, class_id, _, _)| {
                class_filter.as_deref().map(|c| class_id == c).unwrap_or(true)
            })
            .filter_map(|(subject_id, class_id, marks, exam_type)| {
                calc::ExamKind::parse(&exam_type).map(|exam_kind| AnalyticsGradeRow {
                    subject_id,
                    class_id,
                    marks_obtained: marks,
                    exam_kind,
                })
            })
            .collect(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let passes = |g: &AnalyticsGradeRow| -> bool {
        subject_by_id
            .get(g.subject_id.as_str())
            .map(|meta| calc::subject_pass(g.marks_obtained, meta.passing_marks))
            .unwrap_or(false)
    };

    let total_sum: f64 = grades.iter().map(|g| g.marks_obtained).sum();
    let average_marks = calc::round1(mean(total_sum, grades.len()));

    let class_performance: Vec<serde_json::Value> = classes
        .iter()
        .map(|(class_id, class_name)| {
            let class_grades: Vec<&AnalyticsGradeRow> =
                grades.iter().filter(|g| &g.class_id == class_id).collect();
            let student_count = students
                .iter()
                .filter(|(_, c)| c == class_id)
                .count();
            let sum: f64 = class_grades.iter().map(|g| g.marks_obtained).sum();
            let pass_count = class_grades.iter().filter(|g| passes(g)).count();
            json!({
                "classId": class_id,
                "className": class_name,
                "students": student_count,
                "avgScore": calc::round1(mean(sum, class_grades.len())),
                "passRate": calc::round1(rate(pass_count, class_grades.len())),
                "totalGrades": class_grades.len(),
            })
        })
        .collect();

    let subject_performance: Vec<serde_json::Value> = subject_list
        .iter()
        .filter_map(|(subject_id, meta)| {
            let subject_grades: Vec<&AnalyticsGradeRow> = grades
                .iter()
                .filter(|g| &g.subject_id == subject_id)
                .collect();
            if subject_grades.is_empty() {
                return None;
            }
            let sum: f64 = subject_grades.iter().map(|g| g.marks_obtained).sum();
            let pass_count = subject_grades.iter().filter(|g| passes(g)).count();
            Some(json!({
                "subjectId": subject_id,
                "subject": meta.name,
                "avgScore": calc::round1(mean(sum, subject_grades.len())),
                "passRate": calc::round1(rate(pass_count, subject_grades.len())),
                "totalGrades": subject_grades.len(),
                "maxMarks": meta.max_marks,
            }))
        })
        .collect();

    // Histogram over every accessible row, classified against its own
    // subject maximum. All seven buckets are reported, including empties.
    let mut bucket_counts: HashMap<&'static str, usize> = HashMap::new();
    for g in &grades {
        let Some(meta) = subject_by_id.get(g.subject_id.as_str()) else {
            continue;
        };
        let pct = calc::percentage(g.marks_obtained, meta.max_marks);
        *bucket_counts.entry(calc::letter_grade(pct)).or_insert(0) += 1;
    }
    let grade_distribution: Vec<serde_json::Value> = calc::LETTER_GRADES
        .iter()
        .map(|grade| {
            let count = bucket_counts.get(grade).copied().unwrap_or(0);
            json!({
                "grade": grade,
                "count": count,
                "share": (rate(count, grades.len())).round() as i64,
            })
        })
        .collect();

    let exam_type_performance: Vec<serde_json::Value> = [
        calc::ExamKind::Assignment,
        calc::ExamKind::HalfYearly,
        calc::ExamKind::Final,
    ]
    .iter()
    .filter_map(|kind| {
        let kind_grades: Vec<&AnalyticsGradeRow> =
            grades.iter().filter(|g| g.exam_kind == *kind).collect();
        if kind_grades.is_empty() {
            return None;
        }
        let sum: f64 = kind_grades.iter().map(|g| g.marks_obtained).sum();
        Some(json!({
            "examType": kind.as_str(),
            "avgScore": calc::round1(mean(sum, kind_grades.len())),
            "count": kind_grades.len(),
        }))
    })
    .collect();

    let overall_pass_count = grades.iter().filter(|g| passes(g)).count();

    ok(
        &req.id,
        json!({
            "academicYear": academic_year,
            "totals": {
                "students": students.len(),
                "subjects": subject_list.len(),
                "grades": grades.len(),
                "averageMarks": average_marks,
            },
            "classPerformance": class_performance,
            "subjectPerformance": subject_performance,
            "gradeDistribution": grade_distribution,
            "examTypePerformance": exam_type_performance,
            "overallPassRate": calc::round1(rate(overall_pass_count, grades.len())),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.overview" => Some(handle_analytics_overview(state, req)),
        _ => None,
    }
}
