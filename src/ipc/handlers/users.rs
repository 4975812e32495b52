use super::session::require_admin;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, decode_id_list, encode_id_list, now_rfc3339, optional_str, optional_string_list,
    required_str,
};
use crate::ipc::types::{AppState, Request, Role};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn user_json(
    id: &str,
    username: &str,
    role: &str,
    name: &str,
    email: &str,
    assigned_raw: &str,
    access_id: Option<&str>,
    created_at: Option<&str>,
) -> serde_json::Value {
    json!({
        "id": id,
        "username": username,
        "role": role,
        "name": name,
        "email": email,
        "assignedClasses": decode_id_list(assigned_raw),
        "accessId": access_id,
        "createdAt": created_at,
    })
}

fn username_taken(
    conn: &Connection,
    req: &Request,
    username: &str,
    exclude_id: Option<&str>,
) -> Result<bool, serde_json::Value> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM users WHERE username = ?", [username], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    Ok(matches!(found, Some(id) if Some(id.as_str()) != exclude_id))
}

fn check_known_classes(
    conn: &Connection,
    req: &Request,
    class_ids: &[String],
) -> Result<(), serde_json::Value> {
    for class_id in class_ids {
        let known: Option<i64> = conn
            .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
        if known.is_none() {
            return Err(err(
                &req.id,
                "not_found",
                format!("unknown class id: {}", class_id),
                None,
            ));
        }
    }
    Ok(())
}

fn next_access_id(conn: &Connection, req: &Request) -> Result<String, serde_json::Value> {
    let teacher_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM users WHERE role = 'teacher'",
            [],
            |r| r.get(0),
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    Ok(format!("TCH{:03}", teacher_count + 1))
}

/// Pseudo-random digits sourced from a fresh v4 UUID.
fn random_digits(len: usize) -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .map(|b| char::from(b'0' + (b % 10)))
        .take(len)
        .collect()
}

fn random_password() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// 4-letter stem from the display name plus a digit suffix, retried until
/// unused.
fn suggest_username(
    conn: &Connection,
    req: &Request,
    name: &str,
) -> Result<String, serde_json::Value> {
    let stem: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .take(4)
        .collect();
    let stem = format!("{:x<4}", stem);

    for attempt in 0..100usize {
        let digits = random_digits(4 + (attempt % 3));
        let candidate = format!("{}{}", stem, digits);
        if !username_taken(conn, req, &candidate, None)? {
            return Ok(candidate);
        }
    }
    Err(err(
        &req.id,
        "validation_failed",
        "could not derive an unused username",
        None,
    ))
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, username, role, name, email, assigned_classes, access_id, created_at
         FROM users
         ORDER BY username",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let username: String = r.get(1)?;
            let role: String = r.get(2)?;
            let name: String = r.get(3)?;
            let email: String = r.get(4)?;
            let assigned: String = r.get(5)?;
            let access_id: Option<String> = r.get(6)?;
            let created_at: Option<String> = r.get(7)?;
            Ok(user_json(
                &id,
                &username,
                &role,
                &name,
                &email,
                &assigned,
                access_id.as_deref(),
                created_at.as_deref(),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let username = match required_str(req, "username") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let password = match req.params.get("password").and_then(|v| v.as_str()) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing password", None),
    };
    let role_raw = match required_str(req, "role") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assigned_classes = match optional_string_list(req, "assignedClasses") {
        Ok(v) => v.unwrap_or_default(),
        Err(e) => return e,
    };

    let Some(role) = Role::parse(&role_raw) else {
        return err(&req.id, "bad_params", "role must be admin or teacher", None);
    };
    match username_taken(conn, req, &username, None) {
        Ok(true) => {
            return err(
                &req.id,
                "validation_failed",
                format!("username '{}' is already taken", username),
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return e,
    }
    if let Err(e) = check_known_classes(conn, req, &assigned_classes) {
        return e;
    }

    let access_id = match role {
        Role::Teacher => match next_access_id(conn, req) {
            Ok(v) => Some(v),
            Err(e) => return e,
        },
        Role::Admin => None,
    };

    let user_id = Uuid::new_v4().to_string();
    let assigned_raw = encode_id_list(&assigned_classes);
    let created_at = now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, username, password_sha256, role, name, email,
                           assigned_classes, access_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &username,
            db::password_digest(&password),
            role.as_str(),
            &name,
            &email,
            &assigned_raw,
            &access_id,
            &created_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(
        &req.id,
        json!({
            "user": user_json(
                &user_id,
                &username,
                role.as_str(),
                &name,
                &email,
                &assigned_raw,
                access_id.as_deref(),
                Some(&created_at),
            )
        }),
    )
}

fn handle_users_credentials(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let username = match suggest_username(conn, req, &name) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let access_id = match next_access_id(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    ok(
        &req.id,
        json!({
            "username": username,
            "password": random_password(),
            "accessId": access_id,
        }),
    )
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing: Option<(String, String, String, String, String, Option<String>, Option<String>)> =
        match conn
            .query_row(
                "SELECT username, role, name, email, assigned_classes, access_id, created_at
                 FROM users WHERE id = ?",
                [&user_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                    ))
                },
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    let Some((old_username, old_role, old_name, old_email, old_assigned, access_id, created_at)) =
        existing
    else {
        return err(&req.id, "not_found", "user not found", None);
    };

    let username = match optional_str(req, "username") {
        Ok(v) => v.unwrap_or(old_username),
        Err(e) => return e,
    };
    let role_raw = match optional_str(req, "role") {
        Ok(v) => v.unwrap_or(old_role.clone()),
        Err(e) => return e,
    };
    let name = match optional_str(req, "name") {
        Ok(v) => v.unwrap_or(old_name),
        Err(e) => return e,
    };
    let email = match optional_str(req, "email") {
        Ok(v) => v.unwrap_or(old_email),
        Err(e) => return e,
    };
    let assigned_raw = match optional_string_list(req, "assignedClasses") {
        Ok(Some(v)) => {
            if let Err(e) = check_known_classes(conn, req, &v) {
                return e;
            }
            encode_id_list(&v)
        }
        Ok(None) => old_assigned,
        Err(e) => return e,
    };

    let Some(role) = Role::parse(&role_raw) else {
        return err(&req.id, "bad_params", "role must be admin or teacher", None);
    };
    match username_taken(conn, req, &username, Some(&user_id)) {
        Ok(true) => {
            return err(
                &req.id,
                "validation_failed",
                format!("username '{}' is already taken", username),
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return e,
    }

    // Never let the workspace end up without an administrator.
    if old_role == "admin" && role != Role::Admin {
        let admin_count: i64 = match conn.query_row(
            "SELECT COUNT(*) FROM users WHERE role = 'admin'",
            [],
            |r| r.get(0),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if admin_count <= 1 {
            return err(
                &req.id,
                "validation_failed",
                "at least one admin account is required",
                None,
            );
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE users SET username = ?, role = ?, name = ?, email = ?, assigned_classes = ?
         WHERE id = ?",
        (
            &username,
            role.as_str(),
            &name,
            &email,
            &assigned_raw,
            &user_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    if let Some(password) = req.params.get("password").and_then(|v| v.as_str()) {
        if password.is_empty() {
            return err(&req.id, "bad_params", "password must not be empty", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE users SET password_sha256 = ? WHERE id = ?",
            (db::password_digest(password), &user_id),
        ) {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "users" })),
            );
        }
    }

    ok(
        &req.id,
        json!({
            "user": user_json(
                &user_id,
                &username,
                role.as_str(),
                &name,
                &email,
                &assigned_raw,
                access_id.as_deref(),
                created_at.as_deref(),
            )
        }),
    )
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let role: Option<String> = match conn
        .query_row("SELECT role FROM users WHERE id = ?", [&user_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(role) = role else {
        return err(&req.id, "not_found", "user not found", None);
    };

    if role == "admin" {
        let admin_count: i64 = match conn.query_row(
            "SELECT COUNT(*) FROM users WHERE role = 'admin'",
            [],
            |r| r.get(0),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if admin_count <= 1 {
            return err(
                &req.id,
                "validation_failed",
                "at least one admin account is required",
                None,
            );
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly detach references in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "UPDATE classes SET assigned_teacher = NULL WHERE assigned_teacher = ?",
        [&user_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM announcements WHERE created_by = ?", [&user_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "announcements" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM users WHERE id = ?", [&user_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(handle_users_list(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "users.credentials" => Some(handle_users_credentials(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        _ => None,
    }
}
