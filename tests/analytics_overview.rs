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

fn bucket<'a>(distribution: &'a [serde_json::Value], grade: &str) -> &'a serde_json::Value {
    distribution
        .iter()
        .find(|b| b["grade"].as_str() == Some(grade))
        .expect("bucket")
}

#[test]
fn overview_rolls_up_scores_with_the_per_subject_pass_rule() {
    let workspace = temp_dir("resultd-analytics");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "session.login",
        json!({ "username": "admin", "password": "admin123" }),
    );

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "Class 10", "sections": ["A"] }),
    );
    let class_id = class["class"]["id"].as_str().expect("classId").to_string();

    let math = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.create",
        json!({ "name": "Mathematics", "code": "MATH", "maxMarks": 100, "passingMarks": 40, "classIds": [class_id] }),
    );
    let math_id = math["subject"]["id"].as_str().expect("subjectId").to_string();
    // A second subject nobody has grades in yet.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.create",
        json!({ "name": "English", "code": "ENG", "maxMarks": 100, "passingMarks": 40, "classIds": [class_id] }),
    );

    let mut student_ids = Vec::new();
    for (i, roll) in ["R001", "R002"].iter().enumerate() {
        let student = request_ok(
            &mut stdin,
            &mut reader,
            &format!("st{}", i),
            "students.create",
            json!({
                "name": format!("Student {}", i + 1),
                "rollNumber": roll,
                "classId": class_id,
                "section": "A",
                "fatherName": "Father",
                "motherName": "Mother",
                "dateOfBirth": "2010-01-01",
                "address": "Somewhere",
                "phone": "+92-300-0000000",
                "admissionDate": "2023-01-15",
            }),
        );
        student_ids.push(student["student"]["id"].as_str().expect("studentId").to_string());
    }

    // s1: 80/100 half-yearly (passes, band A) and a 15/20 assignment
    // (band F, and failing the raw-vs-passing-marks rule).
    // s2: 30/100 half-yearly (fails, band F).
    let entries = [
        (&student_ids[0], 80.0, "half-yearly", None),
        (&student_ids[0], 15.0, "assignment", Some(1)),
        (&student_ids[1], 30.0, "half-yearly", None),
    ];
    for (i, (student_id, marks, exam_type, term)) in entries.iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "grades.create",
            json!({
                "studentId": student_id,
                "subjectId": math_id,
                "marksObtained": marks,
                "examType": exam_type,
                "term": term,
                "examDate": "2024-12-10",
                "academicYear": "2024-25",
            }),
        );
    }

    let overview = request_ok(
        &mut stdin,
        &mut reader,
        "ov",
        "analytics.overview",
        json!({ "academicYear": "2024-25" }),
    );

    assert_eq!(overview["totals"]["students"].as_u64(), Some(2));
    assert_eq!(overview["totals"]["subjects"].as_u64(), Some(2));
    assert_eq!(overview["totals"]["grades"].as_u64(), Some(3));
    // (80 + 15 + 30) / 3 = 41.666..., reported to one decimal.
    assert_eq!(overview["totals"]["averageMarks"].as_f64(), Some(41.7));
    assert_eq!(overview["overallPassRate"].as_f64(), Some(33.3));

    let class_perf = overview["classPerformance"].as_array().expect("classPerformance");
    assert_eq!(class_perf.len(), 1);
    assert_eq!(class_perf[0]["students"].as_u64(), Some(2));
    assert_eq!(class_perf[0]["avgScore"].as_f64(), Some(41.7));
    assert_eq!(class_perf[0]["passRate"].as_f64(), Some(33.3));
    assert_eq!(class_perf[0]["totalGrades"].as_u64(), Some(3));

    // English has no rows, so only Mathematics reports.
    let subject_perf = overview["subjectPerformance"].as_array().expect("subjectPerformance");
    assert_eq!(subject_perf.len(), 1);
    assert_eq!(subject_perf[0]["subject"].as_str(), Some("Mathematics"));
    assert_eq!(subject_perf[0]["maxMarks"].as_f64(), Some(100.0));

    // Histogram classifies each row against its subject maximum.
    let distribution = overview["gradeDistribution"].as_array().expect("distribution");
    assert_eq!(distribution.len(), 7);
    assert_eq!(bucket(distribution, "A")["count"].as_u64(), Some(1));
    assert_eq!(bucket(distribution, "F")["count"].as_u64(), Some(2));
    assert_eq!(bucket(distribution, "A+")["count"].as_u64(), Some(0));

    let exam_types = overview["examTypePerformance"].as_array().expect("examTypePerformance");
    assert_eq!(exam_types.len(), 2);
    let half_yearly = exam_types
        .iter()
        .find(|e| e["examType"].as_str() == Some("half-yearly"))
        .expect("half-yearly row");
    assert_eq!(half_yearly["avgScore"].as_f64(), Some(55.0));
    assert_eq!(half_yearly["count"].as_u64(), Some(2));

    drop(stdin);
    let _ = child.wait();
}
