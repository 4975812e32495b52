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
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
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

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn login_logout_contract() {
    let workspace = temp_dir("resultd-session");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    // Data methods refuse without a signed-in session.
    let before_workspace = request(&mut stdin, &mut reader, "1", "classes.list", json!({}));
    assert_eq!(error_code(&before_workspace), "no_session");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let no_session = request(&mut stdin, &mut reader, "3", "classes.list", json!({}));
    assert_eq!(error_code(&no_session), "no_session");

    let current = request_ok(&mut stdin, &mut reader, "4", "session.current", json!({}));
    assert!(current["user"].is_null());

    let wrong = request(
        &mut stdin,
        &mut reader,
        "5",
        "session.login",
        json!({ "username": "admin", "password": "wrong" }),
    );
    assert_eq!(error_code(&wrong), "auth_failed");
    let unknown = request(
        &mut stdin,
        &mut reader,
        "6",
        "session.login",
        json!({ "username": "ghost", "password": "admin123" }),
    );
    assert_eq!(error_code(&unknown), "auth_failed");

    // The seeded workspace admin gets in, and the password never comes back.
    let login = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "session.login",
        json!({ "username": "admin", "password": "admin123" }),
    );
    assert_eq!(login["user"]["role"].as_str(), Some("admin"));
    assert!(login["user"].get("password").is_none());

    let current = request_ok(&mut stdin, &mut reader, "8", "session.current", json!({}));
    assert_eq!(current["user"]["username"].as_str(), Some("admin"));

    let _ = request_ok(&mut stdin, &mut reader, "9", "session.logout", json!({}));
    let after = request(&mut stdin, &mut reader, "10", "classes.list", json!({}));
    assert_eq!(error_code(&after), "no_session");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn duplicate_usernames_and_last_admin_are_refused() {
    let workspace = temp_dir("resultd-user-guards");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let login = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "session.login",
        json!({ "username": "admin", "password": "admin123" }),
    );
    let admin_id = login["user"]["id"].as_str().expect("admin id").to_string();

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({
            "username": "teacher1",
            "password": "teacher123",
            "role": "teacher",
            "name": "Class Teacher",
            "email": "teacher1@school.local",
        }),
    );
    assert_eq!(teacher["user"]["accessId"].as_str(), Some("TCH001"));

    let duplicate = request(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({
            "username": "teacher1",
            "password": "other",
            "role": "teacher",
            "name": "Other Teacher",
            "email": "other@school.local",
        }),
    );
    assert_eq!(error_code(&duplicate), "validation_failed");

    // Validation happens before any write: no second account appeared.
    let users = request_ok(&mut stdin, &mut reader, "5", "users.list", json!({}));
    assert_eq!(users["users"].as_array().map(|a| a.len()), Some(2));

    let delete_admin = request(
        &mut stdin,
        &mut reader,
        "6",
        "users.delete",
        json!({ "userId": admin_id }),
    );
    assert_eq!(error_code(&delete_admin), "validation_failed");

    let demote_admin = request(
        &mut stdin,
        &mut reader,
        "7",
        "users.update",
        json!({ "userId": admin_id, "role": "teacher" }),
    );
    assert_eq!(error_code(&demote_admin), "validation_failed");

    // Suggested credentials respect the 4-letter stem + digits shape.
    let creds = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "users.credentials",
        json!({ "name": "Sara Khan" }),
    );
    let username = creds["username"].as_str().expect("username");
    assert!(username.starts_with("sara"), "username = {}", username);
    assert!(username[4..].chars().all(|c| c.is_ascii_digit()));
    assert_eq!(creds["accessId"].as_str(), Some("TCH002"));
    assert!(creds["password"].as_str().map(|p| p.len() >= 8).unwrap_or(false));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn password_change_takes_effect_on_next_login() {
    let workspace = temp_dir("resultd-password-change");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let login = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "session.login",
        json!({ "username": "admin", "password": "admin123" }),
    );
    let admin_id = login["user"]["id"].as_str().expect("admin id").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.update",
        json!({ "userId": admin_id, "password": "rotated456" }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "4", "session.logout", json!({}));

    let stale = request(
        &mut stdin,
        &mut reader,
        "5",
        "session.login",
        json!({ "username": "admin", "password": "admin123" }),
    );
    assert_eq!(error_code(&stale), "auth_failed");
    let fresh = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "session.login",
        json!({ "username": "admin", "password": "rotated456" }),
    );
    assert_eq!(fresh["user"]["username"].as_str(), Some("admin"));

    drop(stdin);
    let _ = child.wait();
}
