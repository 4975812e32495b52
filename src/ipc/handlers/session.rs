use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, decode_id_list, required_str};
use crate::ipc::types::{AppState, Request, Role, Session};
use rusqlite::OptionalExtension;
use serde_json::json;

pub(crate) fn require_session<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a Session, serde_json::Value> {
    state
        .session
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_session", "sign in first", None))
}

pub(crate) fn require_admin<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a Session, serde_json::Value> {
    let session = require_session(state, req)?;
    if session.role != Role::Admin {
        return Err(err(
            &req.id,
            "forbidden",
            "administrator role required",
            None,
        ));
    }
    Ok(session)
}

/// The access gate: admins see everything, teachers only their assigned
/// classes. Every list/report/entry path filters through this before any
/// aggregation happens.
pub(crate) fn can_access_class(session: &Session, class_id: &str) -> bool {
    match session.role {
        Role::Admin => true,
        Role::Teacher => session.assigned_classes.iter().any(|c| c == class_id),
    }
}

pub(crate) fn session_user_json(session: &Session) -> serde_json::Value {
    json!({
        "id": session.user_id,
        "username": session.username,
        "name": session.name,
        "role": session.role.as_str(),
        "assignedClasses": session.assigned_classes,
    })
}

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let username = match required_str(req, "username") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let password = match req.params.get("password").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing password", None),
    };

    let row: Option<(String, String, String, String, String)> = {
        let conn = match db_conn(state, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        match conn
            .query_row(
                "SELECT id, password_sha256, role, name, assigned_classes
                 FROM users WHERE username = ?",
                [&username],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                    ))
                },
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let Some((user_id, digest, role_raw, name, assigned_raw)) = row else {
        return err(&req.id, "auth_failed", "invalid username or password", None);
    };
    if db::password_digest(&password) != digest {
        return err(&req.id, "auth_failed", "invalid username or password", None);
    }
    let Some(role) = Role::parse(&role_raw) else {
        return err(
            &req.id,
            "db_query_failed",
            format!("unknown role for user: {}", role_raw),
            None,
        );
    };

    let session = Session {
        user_id,
        username,
        name,
        role,
        assigned_classes: decode_id_list(&assigned_raw),
    };
    let user = session_user_json(&session);
    state.session = Some(session);
    ok(&req.id, json!({ "user": user }))
}

fn handle_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.session = None;
    ok(&req.id, json!({ "ok": true }))
}

fn handle_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    match state.session.as_ref() {
        Some(s) => ok(&req.id, json!({ "user": session_user_json(s) })),
        None => ok(&req.id, json!({ "user": null })),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.login" => Some(handle_login(state, req)),
        "session.logout" => Some(handle_logout(state, req)),
        "session.current" => Some(handle_current(state, req)),
        _ => None,
    }
}
