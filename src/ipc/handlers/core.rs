use super::session::require_session;
use super::{classes, grades, students, subjects, users};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request, Role};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            // Sessions belong to one workspace's user table.
            state.session = None;
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

/// Reload every collection from scratch in one round trip. Delegates to
/// the per-entity list handlers so filtering stays in exactly one place.
fn handle_data_refresh(state: &mut AppState, req: &Request) -> serde_json::Value {
    let is_admin = match require_session(state, req) {
        Ok(session) => session.role == Role::Admin,
        Err(e) => return e,
    };

    let sub_request = |method: &str| Request {
        id: req.id.clone(),
        method: method.to_string(),
        params: json!({}),
    };
    let mut collections = serde_json::Map::new();
    let mut sets: Vec<(
        &str,
        &str,
        fn(&mut AppState, &Request) -> Option<serde_json::Value>,
    )> = vec![
        ("classes", "classes.list", classes::try_handle),
        ("subjects", "subjects.list", subjects::try_handle),
        ("students", "students.list", students::try_handle),
        ("grades", "grades.list", grades::try_handle),
    ];
    if is_admin {
        sets.push(("users", "users.list", users::try_handle));
    }

    for (key, method, handle) in sets {
        let resp = match handle(state, &sub_request(method)) {
            Some(v) => v,
            None => return err(&req.id, "not_implemented", method, None),
        };
        if resp.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            return resp;
        }
        let rows = resp
            .get("result")
            .and_then(|r| r.get(key))
            .cloned()
            .unwrap_or_else(|| json!([]));
        collections.insert(key.to_string(), rows);
    }

    ok(&req.id, serde_json::Value::Object(collections))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "data.refresh" => Some(handle_data_refresh(state, req)),
        _ => None,
    }
}
