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

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("resultd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "session.login",
        json!({ "username": "admin", "password": "admin123" }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "name": "Class 10", "sections": ["A", "B"] }),
    );
    let class_id = created
        .get("class")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "5", "classes.list", json!({}));

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.create",
        json!({
            "name": "Mathematics",
            "code": "MATH",
            "maxMarks": 100,
            "passingMarks": 40,
            "classIds": [class_id],
        }),
    );
    let subject_id = subject
        .get("subject")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "7", "subjects.list", json!({}));

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "8",
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
    let student_id = student
        .get("student")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "9", "students.list", json!({}));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grades.create",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "marksObtained": 15,
            "examType": "assignment",
            "term": 1,
            "examDate": "2024-10-01",
            "academicYear": "2024-25",
        }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "11", "grades.list", json!({}));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "users.credentials",
        json!({ "name": "Sara Khan" }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "13", "users.list", json!({}));

    let announcement = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "announcements.create",
        json!({ "title": "Exam schedule", "content": "Half-yearly exams start Monday.", "priority": "high" }),
    );
    let announcement_id = announcement
        .get("announcement")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("announcementId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "announcements.list",
        json!({}),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "reports.student",
        json!({ "studentId": student_id, "academicYear": "2024-25", "resultType": "half-yearly" }),
    );
    assert!(report.get("report").is_some());

    let overview = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "analytics.overview",
        json!({ "academicYear": "2024-25" }),
    );
    assert!(overview.get("gradeDistribution").is_some());

    let refreshed = request_ok(&mut stdin, &mut reader, "17b", "data.refresh", json!({}));
    assert_eq!(
        refreshed["students"].as_array().map(|a| a.len()),
        Some(1)
    );
    assert!(refreshed.get("users").is_some());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "announcements.delete",
        json!({ "announcementId": announcement_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "subjects.delete",
        json!({ "subjectId": subject_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "classes.delete",
        json!({ "classId": class_id }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "22", "session.logout", json!({}));

    drop(stdin);
    let _ = child.wait();
}
