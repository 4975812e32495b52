use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_resultd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Fixture {
    student_id: String,
    math_id: String,
}

/// Class 10 with Math and English; Ahmed has Term-1 assignments [15, 18]
/// and an 82-mark half-yearly in Math, nothing in English.
fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s2",
        "session.login",
        json!({ "username": "admin", "password": "admin123" }),
    );
    let class = request_ok(
        stdin,
        reader,
        "s3",
        "classes.create",
        json!({ "name": "Class 10", "sections": ["A"] }),
    );
    let class_id = class["class"]["id"].as_str().expect("classId").to_string();

    let math = request_ok(
        stdin,
        reader,
        "s4",
        "subjects.create",
        json!({
            "name": "Mathematics",
            "code": "MATH",
            "maxMarks": 100,
            "passingMarks": 40,
            "classIds": [class_id],
        }),
    );
    let math_id = math["subject"]["id"].as_str().expect("subjectId").to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s5",
        "subjects.create",
        json!({
            "name": "English",
            "code": "ENG",
            "maxMarks": 100,
            "passingMarks": 40,
            "classIds": [class_id],
        }),
    );

    let student = request_ok(
        stdin,
        reader,
        "s6",
        "students.create",
        json!({
            "name": "Ahmed Hassan",
            "rollNumber": "JRP001",
            "classId": class_id,
            "section": "A",
            "fatherName": "Hassan Ali",
            "motherName": "Fatima Hassan",
            "dateOfBirth": "2008-05-15",
            "address": "123 Main Street",
            "phone": "+92-300-1234567",
            "admissionDate": "2023-01-15",
        }),
    );
    let student_id = student["student"]["id"].as_str().expect("studentId").to_string();

    for (i, (marks, term)) in [(15.0, 1), (18.0, 1)].iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("g{}", i),
            "grades.create",
            json!({
                "studentId": student_id,
                "subjectId": math_id,
                "marksObtained": marks,
                "examType": "assignment",
                "term": term,
                "examDate": "2024-10-01",
                "academicYear": "2024-25",
            }),
        );
    }
    let _ = request_ok(
        stdin,
        reader,
        "g2",
        "grades.create",
        json!({
            "studentId": student_id,
            "subjectId": math_id,
            "marksObtained": 82,
            "examType": "half-yearly",
            "examDate": "2024-12-10",
            "academicYear": "2024-25",
        }),
    );

    Fixture {
        student_id,
        math_id,
    }
}

#[test]
fn half_yearly_report_matches_fixed_totals() {
    let workspace = temp_dir("resultd-report-half");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed(&mut stdin, &mut reader, &workspace);

    let payload = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.student",
        json!({ "studentId": fx.student_id, "academicYear": "2024-25", "resultType": "half-yearly" }),
    );
    let result = &payload["report"]["result"];

    assert_eq!(result["totalMarks"].as_f64(), Some(140.0));
    assert_eq!(result["obtainedMarks"].as_f64(), Some(97.0));
    let pct = result["percentage"].as_f64().expect("percentage");
    assert!((pct - 69.2857).abs() < 0.001, "pct = {}", pct);
    assert_eq!(result["grade"].as_str(), Some("B"));
    assert_eq!(result["status"].as_str(), Some("pass"));

    // English has no grades and must not appear at all.
    let subjects = result["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 1);
    assert_eq!(subjects[0]["subjectId"].as_str(), Some(fx.math_id.as_str()));

    let document = &payload["report"]["document"];
    assert_eq!(document["title"].as_str(), Some("HALF YEARLY RESULT"));
    assert_eq!(
        document["fileName"].as_str(),
        Some("Ahmed Hassan_JRP001_HalfYearly_2024-25.pdf")
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn full_yearly_report_counts_missing_final_as_zero() {
    let workspace = temp_dir("resultd-report-full");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed(&mut stdin, &mut reader, &workspace);

    for (i, marks) in [16.0, 19.0].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("t2-{}", i),
            "grades.create",
            json!({
                "studentId": fx.student_id,
                "subjectId": fx.math_id,
                "marksObtained": marks,
                "examType": "assignment",
                "term": 2,
                "examDate": "2025-03-01",
                "academicYear": "2024-25",
            }),
        );
    }

    let payload = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.student",
        json!({ "studentId": fx.student_id, "academicYear": "2024-25", "resultType": "full-yearly" }),
    );
    let result = &payload["report"]["result"];

    // 80 assignment marks + 2 * 100 exam marks possible; the unwritten
    // final contributes 0 obtained but stays in the denominator.
    assert_eq!(result["totalMarks"].as_f64(), Some(280.0));
    assert_eq!(result["obtainedMarks"].as_f64(), Some(150.0));
    let pct = result["percentage"].as_f64().expect("percentage");
    assert!((pct - 53.5714).abs() < 0.001, "pct = {}", pct);
    assert_eq!(result["grade"].as_str(), Some("D"));
    assert_eq!(result["status"].as_str(), Some("pass"));

    let line = &result["subjects"][0];
    assert_eq!(line["term2AssignmentMarks"].as_f64(), Some(35.0));
    assert!(line["finalMarks"].is_null());

    let document = &payload["report"]["document"];
    assert_eq!(document["title"].as_str(), Some("ANNUAL RESULT"));
    assert_eq!(
        document["fileName"].as_str(),
        Some("Ahmed Hassan_JRP001_Annual_2024-25.pdf")
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn bulk_reports_cover_matching_students() {
    let workspace = temp_dir("resultd-report-bulk");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _fx = seed(&mut stdin, &mut reader, &workspace);

    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.bulk",
        json!({ "academicYear": "2024-25", "resultType": "half-yearly" }),
    );
    let reports = bulk["reports"].as_array().expect("reports");
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0]["student"]["rollNumber"].as_str(),
        Some("JRP001")
    );

    // A section filter that matches nobody yields an empty set, not an error.
    let none = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.bulk",
        json!({ "academicYear": "2024-25", "resultType": "half-yearly", "section": "Z" }),
    );
    assert_eq!(none["reports"].as_array().map(|a| a.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
}
