use super::session::{require_admin, require_session};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, decode_id_list, encode_id_list, optional_f64, optional_str, optional_string_list,
    required_f64, required_str, string_list,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn subject_json(
    id: &str,
    name: &str,
    code: &str,
    max_marks: f64,
    passing_marks: f64,
    class_ids_raw: &str,
) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "code": code,
        "maxMarks": max_marks,
        "passingMarks": passing_marks,
        "classIds": decode_id_list(class_ids_raw),
    })
}

fn check_marks_invariant(
    req: &Request,
    max_marks: f64,
    passing_marks: f64,
) -> Result<(), serde_json::Value> {
    if max_marks <= 0.0 {
        return Err(err(
            &req.id,
            "validation_failed",
            "maxMarks must be positive",
            None,
        ));
    }
    if passing_marks < 0.0 {
        return Err(err(
            &req.id,
            "validation_failed",
            "passingMarks must not be negative",
            None,
        ));
    }
    if passing_marks > max_marks {
        return Err(err(
            &req.id,
            "validation_failed",
            "passingMarks must not exceed maxMarks",
            Some(json!({ "maxMarks": max_marks, "passingMarks": passing_marks })),
        ));
    }
    Ok(())
}

fn check_known_classes(
    conn: &rusqlite::Connection,
    req: &Request,
    class_ids: &[String],
) -> Result<(), serde_json::Value> {
    for class_id in class_ids {
        let known: Option<i64> = match conn
            .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => return Err(err(&req.id, "db_query_failed", e.to_string(), None)),
        };
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

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_session(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, code, max_marks, passing_marks, class_ids
         FROM subjects
         ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let code: String = row.get(2)?;
            let max_marks: f64 = row.get(3)?;
            let passing_marks: f64 = row.get(4)?;
            let class_ids: String = row.get(5)?;
            Ok(subject_json(
                &id,
                &name,
                &code,
                max_marks,
                passing_marks,
                &class_ids,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_marks = match required_f64(req, "maxMarks") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let passing_marks = match required_f64(req, "passingMarks") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_ids = match string_list(req, "classIds") {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = check_marks_invariant(req, max_marks, passing_marks) {
        return e;
    }
    if let Err(e) = check_known_classes(conn, req, &class_ids) {
        return e;
    }

    let subject_id = Uuid::new_v4().to_string();
    let class_ids_raw = encode_id_list(&class_ids);
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, code, max_marks, passing_marks, class_ids)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &subject_id,
            &name,
            &code,
            max_marks,
            passing_marks,
            &class_ids_raw,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(
        &req.id,
        json!({
            "subject": subject_json(&subject_id, &name, &code, max_marks, passing_marks, &class_ids_raw)
        }),
    )
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing: Option<(String, String, f64, f64, String)> = match conn
        .query_row(
            "SELECT name, code, max_marks, passing_marks, class_ids FROM subjects WHERE id = ?",
            [&subject_id],
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
    };
    let Some((old_name, old_code, old_max, old_passing, old_classes)) = existing else {
        return err(&req.id, "not_found", "subject not found", None);
    };

    let name = match optional_str(req, "name") {
        Ok(v) => v.unwrap_or(old_name),
        Err(e) => return e,
    };
    let code = match optional_str(req, "code") {
        Ok(v) => v.unwrap_or(old_code),
        Err(e) => return e,
    };
    let max_marks = match optional_f64(req, "maxMarks") {
        Ok(v) => v.unwrap_or(old_max),
        Err(e) => return e,
    };
    let passing_marks = match optional_f64(req, "passingMarks") {
        Ok(v) => v.unwrap_or(old_passing),
        Err(e) => return e,
    };
    let class_ids_raw = match optional_string_list(req, "classIds") {
        Ok(Some(v)) => {
            if let Err(e) = check_known_classes(conn, req, &v) {
                return e;
            }
            encode_id_list(&v)
        }
        Ok(None) => old_classes,
        Err(e) => return e,
    };

    // The invariant holds on the merged record, not just the patch.
    if let Err(e) = check_marks_invariant(req, max_marks, passing_marks) {
        return e;
    }

    if let Err(e) = conn.execute(
        "UPDATE subjects SET name = ?, code = ?, max_marks = ?, passing_marks = ?, class_ids = ?
         WHERE id = ?",
        (
            &name,
            &code,
            max_marks,
            passing_marks,
            &class_ids_raw,
            &subject_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(
        &req.id,
        json!({
            "subject": subject_json(&subject_id, &name, &code, max_marks, passing_marks, &class_ids_raw)
        }),
    )
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state, req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Grades reference the subject; delete them first (no ON DELETE CASCADE).
    if let Err(e) = tx.execute("DELETE FROM grades WHERE subject_id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
