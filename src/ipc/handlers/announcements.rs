use super::session::{require_admin, require_session};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_rfc3339, optional_bool, optional_str, required_str};
use crate::ipc::types::{AppState, Request, Role};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const PRIORITIES: [&str; 3] = ["low", "medium", "high"];

fn announcement_json(
    id: &str,
    title: &str,
    content: &str,
    priority: &str,
    created_by: &str,
    active: bool,
    created_at: Option<&str>,
) -> serde_json::Value {
    json!({
        "id": id,
        "title": title,
        "content": content,
        "priority": priority,
        "createdBy": created_by,
        "active": active,
        "createdAt": created_at,
    })
}

fn check_priority(req: &Request, priority: &str) -> Result<(), serde_json::Value> {
    if PRIORITIES.contains(&priority) {
        Ok(())
    } else {
        Err(err(
            &req.id,
            "bad_params",
            "priority must be one of: low, medium, high",
            None,
        ))
    }
}

fn handle_announcements_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let include_inactive = match optional_bool(req, "includeInactive") {
        Ok(v) => v.unwrap_or(false) && session.role == Role::Admin,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, title, content, priority, created_by, active, created_at
         FROM announcements
         ORDER BY created_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let content: String = r.get(2)?;
            let priority: String = r.get(3)?;
            let created_by: String = r.get(4)?;
            let active: i64 = r.get(5)?;
            let created_at: Option<String> = r.get(6)?;
            Ok((id, title, content, priority, created_by, active != 0, created_at))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(all) => {
            let announcements: Vec<serde_json::Value> = all
                .iter()
                .filter(|row| row.5 || include_inactive)
                .map(|row| {
                    announcement_json(
                        &row.0,
                        &row.1,
                        &row.2,
                        &row.3,
                        &row.4,
                        row.5,
                        row.6.as_deref(),
                    )
                })
                .collect();
            ok(&req.id, json!({ "announcements": announcements }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_announcements_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_admin(state, req) {
        Ok(v) => v.clone(),
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let content = match required_str(req, "content") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let priority = match optional_str(req, "priority") {
        Ok(v) => v.unwrap_or_else(|| "medium".to_string()),
        Err(e) => return e,
    };
    if let Err(e) = check_priority(req, &priority) {
        return e;
    }

    let announcement_id = Uuid::new_v4().to_string();
    let created_at = now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO announcements(id, title, content, priority, created_by, active, created_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (
            &announcement_id,
            &title,
            &content,
            &priority,
            &session.user_id,
            &created_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "announcements" })),
        );
    }

    ok(
        &req.id,
        json!({
            "announcement": announcement_json(
                &announcement_id,
                &title,
                &content,
                &priority,
                &session.user_id,
                true,
                Some(&created_at),
            )
        }),
    )
}

fn handle_announcements_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let announcement_id = match required_str(req, "announcementId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing: Option<(String, String, String, String, i64, Option<String>)> = match conn
        .query_row(
            "SELECT title, content, priority, created_by, active, created_at
             FROM announcements WHERE id = ?",
            [&announcement_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((old_title, old_content, old_priority, created_by, old_active, created_at)) = existing
    else {
        return err(&req.id, "not_found", "announcement not found", None);
    };

    let title = match optional_str(req, "title") {
        Ok(v) => v.unwrap_or(old_title),
        Err(e) => return e,
    };
    let content = match optional_str(req, "content") {
        Ok(v) => v.unwrap_or(old_content),
        Err(e) => return e,
    };
    let priority = match optional_str(req, "priority") {
        Ok(v) => v.unwrap_or(old_priority),
        Err(e) => return e,
    };
    if let Err(e) = check_priority(req, &priority) {
        return e;
    }
    let active = match optional_bool(req, "active") {
        Ok(v) => v.unwrap_or(old_active != 0),
        Err(e) => return e,
    };

    if let Err(e) = conn.execute(
        "UPDATE announcements SET title = ?, content = ?, priority = ?, active = ? WHERE id = ?",
        (&title, &content, &priority, active as i64, &announcement_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "announcements" })),
        );
    }

    ok(
        &req.id,
        json!({
            "announcement": announcement_json(
                &announcement_id,
                &title,
                &content,
                &priority,
                &created_by,
                active,
                created_at.as_deref(),
            )
        }),
    )
}

fn handle_announcements_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let announcement_id = match required_str(req, "announcementId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let affected = match conn.execute(
        "DELETE FROM announcements WHERE id = ?",
        [&announcement_id],
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "announcements" })),
            )
        }
    };
    if affected == 0 {
        return err(&req.id, "not_found", "announcement not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "announcements.list" => Some(handle_announcements_list(state, req)),
        "announcements.create" => Some(handle_announcements_create(state, req)),
        "announcements.update" => Some(handle_announcements_update(state, req)),
        "announcements.delete" => Some(handle_announcements_delete(state, req)),
        _ => None,
    }
}
