use crate::api::error::{reply, HandlerErr};
use crate::api::guard::Auth;
use crate::api::lookup::{class_for, subject_for};
use crate::api::params::req_str;
use crate::api::types::{AppState, Request};
use crate::results::load_subjects;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn find_by_name(conn: &Connection, class_id: &str, name: &str) -> Result<Option<String>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id FROM subjects WHERE class_id = ? AND name = ? COLLATE NOCASE",
            (class_id, name),
            |r| r.get(0),
        )
        .optional()?)
}

fn insert_subject(conn: &Connection, class_id: &str, name: &str) -> Result<String, HandlerErr> {
    let next_sort: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM subjects WHERE class_id = ?",
        [class_id],
        |r| r.get(0),
    )?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, class_id, name, sort_order) VALUES(?, ?, ?, ?)",
        (&id, class_id, name, next_sort),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "subjects", e))?;
    Ok(id)
}

fn subjects_list(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = req_str(params, "classId")?;
    class_for(conn, session, &class_id)?;
    let subjects = load_subjects(conn, &class_id)?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = req_str(params, "classId")?;
    class_for(conn, session, &class_id)?;
    let name = req_str(params, "name")?;
    if find_by_name(conn, &class_id, &name)?.is_some() {
        return Err(HandlerErr::conflict("subject already exists in this class"));
    }
    let id = insert_subject(conn, &class_id, &name)?;
    Ok(json!({ "id": id, "classId": class_id, "name": name }))
}

fn subjects_update(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let subject_id = req_str(params, "subjectId")?;
    let (subject, _) = subject_for(conn, session, &subject_id)?;
    let name = req_str(params, "name")?;
    if let Some(other) = find_by_name(conn, &subject.class_id, &name)? {
        if other != subject.id {
            return Err(HandlerErr::conflict("subject already exists in this class"));
        }
    }
    conn.execute("UPDATE subjects SET name = ? WHERE id = ?", (&name, &subject.id))
        .map_err(|e| HandlerErr::db("db_update_failed", "subjects", e))?;
    Ok(json!({ "id": subject.id, "classId": subject.class_id, "name": name }))
}

fn subjects_delete(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let subject_id = req_str(params, "subjectId")?;
    let (subject, _) = subject_for(conn, session, &subject_id)?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let removed_scores = tx
        .execute("DELETE FROM scores WHERE subject_id = ?", [&subject.id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "scores", e))?;
    tx.execute("DELETE FROM subjects WHERE id = ?", [&subject.id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "subjects", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "removedScores": removed_scores }))
}

fn subjects_copy(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let from = req_str(params, "fromClassId")?;
    let to = req_str(params, "toClassId")?;
    class_for(conn, session, &from)?;
    class_for(conn, session, &to)?;
    if from == to {
        return Err(HandlerErr::bad_params("source and target class are the same"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut created = 0usize;
    let mut skipped = 0usize;
    for subject in load_subjects(&tx, &from)? {
        if find_by_name(&tx, &to, &subject.name)?.is_some() {
            skipped += 1;
            continue;
        }
        insert_subject(&tx, &to, &subject.name)?;
        created += 1;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "created": created, "skipped": skipped }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "subjects.list" => subjects_list(conn, auth, &req.params),
        "subjects.create" => subjects_create(conn, auth, &req.params),
        "subjects.update" => subjects_update(conn, auth, &req.params),
        "subjects.delete" => subjects_delete(conn, auth, &req.params),
        "subjects.copy" => subjects_copy(conn, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
