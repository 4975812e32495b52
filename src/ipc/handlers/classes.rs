use super::session::{can_access_class, require_admin, require_session};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, decode_id_list, encode_id_list, optional_str, optional_string_list, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn class_json(
    id: &str,
    name: &str,
    sections_raw: &str,
    assigned_teacher: Option<String>,
    student_count: i64,
) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "sections": decode_id_list(sections_raw),
        "assignedTeacher": assigned_teacher,
        "studentCount": student_count,
    })
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Include student counts so the UI can show a useful dashboard.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.sections,
           c.assigned_teacher,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
         FROM classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let sections: String = row.get(2)?;
            let assigned_teacher: Option<String> = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            Ok((id, name, sections, assigned_teacher, student_count))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(all) => {
            let classes: Vec<serde_json::Value> = all
                .into_iter()
                .filter(|(id, ..)| can_access_class(session, id))
                .map(|(id, name, sections, teacher, count)| {
                    class_json(&id, &name, &sections, teacher, count)
                })
                .collect();
            ok(&req.id, json!({ "classes": classes }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let sections = match optional_string_list(req, "sections") {
        Ok(v) => v.unwrap_or_default(),
        Err(e) => return e,
    };

    let duplicate: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE name = ?", [&name], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if duplicate.is_some() {
        return err(
            &req.id,
            "validation_failed",
            format!("a class named '{}' already exists", name),
            None,
        );
    }

    let class_id = Uuid::new_v4().to_string();
    let sections_raw = encode_id_list(&sections);
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, sections, assigned_teacher) VALUES(?, ?, ?, NULL)",
        (&class_id, &name, &sections_raw),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(
        &req.id,
        json!({ "class": class_json(&class_id, &name, &sections_raw, None, 0) }),
    )
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing: Option<(String, String, Option<String>)> = match conn
        .query_row(
            "SELECT name, sections, assigned_teacher FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((old_name, old_sections, old_teacher)) = existing else {
        return err(&req.id, "not_found", "class not found", None);
    };

    let name = match optional_str(req, "name") {
        Ok(v) => v.unwrap_or(old_name.clone()),
        Err(e) => return e,
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    if name != old_name {
        let duplicate: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM classes WHERE name = ? AND id != ?",
                (&name, &class_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if duplicate.is_some() {
            return err(
                &req.id,
                "validation_failed",
                format!("a class named '{}' already exists", name),
                None,
            );
        }
    }

    let sections_raw = match optional_string_list(req, "sections") {
        Ok(Some(v)) => encode_id_list(&v),
        Ok(None) => old_sections,
        Err(e) => return e,
    };

    // assignedTeacher: absent keeps the current value, null clears it.
    let assigned_teacher: Option<String> = match req.params.get("assignedTeacher") {
        None => old_teacher,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(teacher_id) = v.as_str() else {
                return err(
                    &req.id,
                    "bad_params",
                    "assignedTeacher must be a string or null",
                    None,
                );
            };
            let known: Option<String> = match conn
                .query_row(
                    "SELECT role FROM users WHERE id = ?",
                    [teacher_id],
                    |r| r.get(0),
                )
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            match known.as_deref() {
                Some("teacher") => Some(teacher_id.to_string()),
                Some(_) => {
                    return err(
                        &req.id,
                        "validation_failed",
                        "assignedTeacher must reference a teacher account",
                        None,
                    )
                }
                None => return err(&req.id, "not_found", "teacher not found", None),
            }
        }
    };

    if let Err(e) = conn.execute(
        "UPDATE classes SET name = ?, sections = ?, assigned_teacher = ? WHERE id = ?",
        (&name, &sections_raw, &assigned_teacher, &class_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    let student_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .unwrap_or(0);
    ok(
        &req.id,
        json!({
            "class": class_json(&class_id, &name, &sections_raw, assigned_teacher, student_count)
        }),
    )
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let student_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_count > 0 {
        return err(
            &req.id,
            "validation_failed",
            "class still has students; move or delete them first",
            Some(json!({ "studentCount": student_count })),
        );
    }

    if let Err(e) = conn.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
