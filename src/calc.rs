use serde::Serialize;
use std::collections::HashMap;

/// Per-term assignment cap enforced at entry time.
pub const ASSIGNMENTS_PER_TERM: i64 = 2;
/// Every assignment is marked out of 20, independent of the subject's
/// exam maximum. Two assignments per term give the fixed 40/80 totals.
pub const ASSIGNMENT_OUT_OF: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExamKind {
    Assignment,
    HalfYearly,
    Final,
}

impl ExamKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "assignment" => Some(ExamKind::Assignment),
            "half-yearly" => Some(ExamKind::HalfYearly),
            "final" => Some(ExamKind::Final),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExamKind::Assignment => "assignment",
            ExamKind::HalfYearly => "half-yearly",
            ExamKind::Final => "final",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    HalfYearly,
    FullYearly,
}

impl ReportMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "half-yearly" => Some(ReportMode::HalfYearly),
            "full-yearly" => Some(ReportMode::FullYearly),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReportMode::HalfYearly => "half-yearly",
            ReportMode::FullYearly => "full-yearly",
        }
    }

    /// Tag used in the report artifact filename.
    pub fn artifact_tag(self) -> &'static str {
        match self {
            ReportMode::HalfYearly => "HalfYearly",
            ReportMode::FullYearly => "Annual",
        }
    }
}

/// In-memory grade row, as loaded by the handlers.
#[derive(Debug, Clone)]
pub struct GradeRow {
    pub student_id: String,
    pub subject_id: String,
    pub marks_obtained: f64,
    pub exam_kind: ExamKind,
    pub term: Option<i64>,
    pub academic_year: String,
}

#[derive(Debug, Clone)]
pub struct SubjectRow {
    pub id: String,
    pub name: String,
    pub code: String,
    pub max_marks: f64,
    pub passing_marks: f64,
    pub class_ids: Vec<String>,
}

/// One subject's contribution to a student report. A subject with no
/// matching grades never produces a line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub subject_id: String,
    pub subject_name: String,
    pub subject_code: String,
    pub term1_assignment_marks: f64,
    pub term2_assignment_marks: f64,
    pub half_yearly_marks: Option<f64>,
    pub final_marks: Option<f64>,
    pub total_possible: f64,
    pub obtained: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub result_type: String,
    pub academic_year: String,
    pub subjects: Vec<SubjectLine>,
    pub total_marks: f64,
    pub obtained_marks: f64,
    pub percentage: f64,
    pub grade: String,
    pub status: String,
}

/// obtained/total as a percentage, 0 when the denominator is empty.
pub fn percentage(obtained: f64, total: f64) -> f64 {
    if total > 0.0 {
        100.0 * obtained / total
    } else {
        0.0
    }
}

/// Fixed 7-band letter table, lower bounds inclusive.
pub fn letter_grade(pct: f64) -> &'static str {
    if pct >= 90.0 {
        "A+"
    } else if pct >= 80.0 {
        "A"
    } else if pct >= 70.0 {
        "B"
    } else if pct >= 60.0 {
        "C"
    } else if pct >= 50.0 {
        "D"
    } else if pct >= 40.0 {
        "E"
    } else {
        "F"
    }
}

pub const LETTER_GRADES: [&str; 7] = ["A+", "A", "B", "C", "D", "E", "F"];

/// Report verdict: a fixed 40% floor on the whole-result percentage.
/// Deliberately distinct from [`subject_pass`]; both rules ship.
pub fn report_pass_status(pct: f64) -> &'static str {
    if pct >= 40.0 {
        "pass"
    } else {
        "fail"
    }
}

/// Per-subject rule used by the analytics pass rates: raw marks against
/// the subject's own passing threshold.
pub fn subject_pass(marks_obtained: f64, passing_marks: f64) -> bool {
    marks_obtained >= passing_marks
}

/// 1-decimal rounding used for analytics figures: `Int(10*x + 0.5) / 10`.
pub fn round1(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Aggregate one student's grades for an academic year into a classified
/// report.
///
/// Grades are filtered to the student and year, partitioned by subject,
/// then split by exam category (assignments further by term). Subjects the
/// student's class is not taught, or with no matching grades, are omitted.
/// Missing half-yearly/final marks contribute 0 to obtained but their full
/// maximum stays in the possible total.
pub fn aggregate_student(
    student_id: &str,
    student_class: &str,
    grades: &[GradeRow],
    subjects: &[SubjectRow],
    academic_year: &str,
    mode: ReportMode,
) -> StudentReport {
    let mut by_subject: HashMap<&str, Vec<&GradeRow>> = HashMap::new();
    for g in grades {
        if g.student_id == student_id && g.academic_year == academic_year {
            by_subject.entry(g.subject_id.as_str()).or_default().push(g);
        }
    }

    let mut lines: Vec<SubjectLine> = Vec::new();
    for subject in subjects {
        if !subject.class_ids.iter().any(|c| c == student_class) {
            continue;
        }
        let Some(subject_grades) = by_subject.get(subject.id.as_str()) else {
            continue;
        };

        let mut term1 = 0.0_f64;
        let mut term2 = 0.0_f64;
        let mut half_yearly: Option<f64> = None;
        let mut final_exam: Option<f64> = None;
        for g in subject_grades {
            match g.exam_kind {
                ExamKind::Assignment => match g.term {
                    Some(1) => term1 += g.marks_obtained,
                    Some(2) => term2 += g.marks_obtained,
                    _ => {}
                },
                ExamKind::HalfYearly => half_yearly = Some(g.marks_obtained),
                ExamKind::Final => final_exam = Some(g.marks_obtained),
            }
        }

        let assignment_cap = ASSIGNMENT_OUT_OF * ASSIGNMENTS_PER_TERM as f64;
        let (total_possible, obtained) = match mode {
            ReportMode::HalfYearly => (
                assignment_cap + subject.max_marks,
                term1 + half_yearly.unwrap_or(0.0),
            ),
            ReportMode::FullYearly => (
                2.0 * assignment_cap + 2.0 * subject.max_marks,
                term1 + term2 + half_yearly.unwrap_or(0.0) + final_exam.unwrap_or(0.0),
            ),
        };

        lines.push(SubjectLine {
            subject_id: subject.id.clone(),
            subject_name: subject.name.clone(),
            subject_code: subject.code.clone(),
            term1_assignment_marks: term1,
            term2_assignment_marks: term2,
            half_yearly_marks: half_yearly,
            final_marks: final_exam,
            total_possible,
            obtained,
        });
    }

    let total_marks: f64 = lines.iter().map(|l| l.total_possible).sum();
    let obtained_marks: f64 = lines.iter().map(|l| l.obtained).sum();
    let pct = percentage(obtained_marks, total_marks);

    StudentReport {
        result_type: mode.as_str().to_string(),
        academic_year: academic_year.to_string(),
        subjects: lines,
        total_marks,
        obtained_marks,
        percentage: pct,
        grade: letter_grade(pct).to_string(),
        status: report_pass_status(pct).to_string(),
    }
}
