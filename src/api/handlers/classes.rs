use crate::api::error::{reply, HandlerErr};
use crate::api::guard::{ensure_branch, scope_branch, Auth};
use crate::api::lookup::{branch_exists, class_for};
use crate::api::params::{opt_i64, opt_str, req_str};
use crate::api::types::{AppState, Request};
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

const CLASS_SELECT: &str = "SELECT
       c.id,
       c.branch_id,
       b.name,
       c.name,
       c.level,
       (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.active = 1) AS student_count,
       (SELECT COUNT(*) FROM subjects sub WHERE sub.class_id = c.id) AS subject_count
     FROM classes c
     JOIN branches b ON b.id = c.branch_id";

fn class_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "branchId": r.get::<_, String>(1)?,
        "branchName": r.get::<_, String>(2)?,
        "name": r.get::<_, String>(3)?,
        "level": r.get::<_, i64>(4)?,
        "studentCount": r.get::<_, i64>(5)?,
        "subjectCount": r.get::<_, i64>(6)?,
    }))
}

fn class_json(conn: &Connection, class_id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        &format!("{CLASS_SELECT} WHERE c.id = ?"),
        [class_id],
        class_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("class"))
}

fn name_taken(
    conn: &Connection,
    branch_id: &str,
    name: &str,
    except: Option<&str>,
) -> Result<bool, HandlerErr> {
    let hit: Option<String> = conn
        .query_row(
            "SELECT id FROM classes WHERE branch_id = ? AND name = ? COLLATE NOCASE",
            (branch_id, name),
            |r| r.get(0),
        )
        .optional()?;
    Ok(matches!(hit, Some(id) if Some(id.as_str()) != except))
}

fn classes_list(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let scope = scope_branch(session, opt_str(params, "branchId"))?;
    let mut stmt = conn.prepare(&format!(
        "{CLASS_SELECT}
         WHERE (?1 IS NULL OR c.branch_id = ?1)
         ORDER BY b.name COLLATE NOCASE, c.level, c.name COLLATE NOCASE"
    ))?;
    let classes = stmt
        .query_map([scope], class_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": classes }))
}

fn classes_create(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let branch_id = req_str(params, "branchId")?;
    ensure_branch(session, &branch_id)?;
    if !branch_exists(conn, &branch_id)? {
        return Err(HandlerErr::not_found("branch"));
    }
    let name = req_str(params, "name")?;
    let level = opt_i64(params, "level")?.unwrap_or(0);
    if name_taken(conn, &branch_id, &name, None)? {
        return Err(HandlerErr::conflict("class name already used in this branch"));
    }

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, branch_id, name, level, created_at) VALUES(?, ?, ?, ?, ?)",
        (&class_id, &branch_id, &name, level, db::now_ts()),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "classes", e))?;
    class_json(conn, &class_id)
}

fn classes_update(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = req_str(params, "classId")?;
    let class = class_for(conn, session, &class_id)?;
    if let Some(name) = opt_str(params, "name") {
        if name_taken(conn, &class.branch_id, &name, Some(&class_id))? {
            return Err(HandlerErr::conflict("class name already used in this branch"));
        }
        conn.execute("UPDATE classes SET name = ? WHERE id = ?", (&name, &class_id))
            .map_err(|e| HandlerErr::db("db_update_failed", "classes", e))?;
    }
    if let Some(level) = opt_i64(params, "level")? {
        conn.execute("UPDATE classes SET level = ? WHERE id = ?", (level, &class_id))
            .map_err(|e| HandlerErr::db("db_update_failed", "classes", e))?;
    }
    class_json(conn, &class_id)
}

fn classes_delete(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = req_str(params, "classId")?;
    class_for(conn, session, &class_id)?;

    let enrolled: i64 = conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    )?;
    if enrolled > 0 {
        return Err(HandlerErr::conflict("class still has students enrolled")
            .with_details(json!({ "students": enrolled })));
    }
    let paid: i64 = conn.query_row(
        "SELECT COUNT(*) FROM payments WHERE fee_id IN (SELECT id FROM fees WHERE class_id = ?)",
        [&class_id],
        |r| r.get(0),
    )?;
    if paid > 0 {
        return Err(HandlerErr::conflict("class fees have recorded payments")
            .with_details(json!({ "payments": paid })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    let steps: [(&str, &str); 8] = [
        ("scores", "DELETE FROM scores WHERE class_id = ?"),
        ("score_publications", "DELETE FROM score_publications WHERE class_id = ?"),
        ("attendance_records", "DELETE FROM attendance_records WHERE class_id = ?"),
        (
            "scores",
            "DELETE FROM scores WHERE subject_id IN (SELECT id FROM subjects WHERE class_id = ?)",
        ),
        ("subjects", "DELETE FROM subjects WHERE class_id = ?"),
        ("fees", "DELETE FROM fees WHERE class_id = ?"),
        (
            "notification_reads",
            "DELETE FROM notification_reads WHERE notification_id IN
               (SELECT id FROM notifications WHERE audience = 'class' AND target_id = ?)",
        ),
        (
            "notifications",
            "DELETE FROM notifications WHERE audience = 'class' AND target_id = ?",
        ),
    ];
    for (table, sql) in steps {
        tx.execute(sql, [&class_id])
            .map_err(|e| HandlerErr::db("db_delete_failed", table, e))?;
    }
    tx.execute("DELETE FROM classes WHERE id = ?", [&class_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "classes", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(class_id = %class_id, "class deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "classes.list" => classes_list(conn, auth, &req.params),
        "classes.create" => classes_create(conn, auth, &req.params),
        "classes.update" => classes_update(conn, auth, &req.params),
        "classes.delete" => classes_delete(conn, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
