use crate::api::error::{reply, HandlerErr};
use crate::api::guard::{scope_branch, Auth};
use crate::api::lookup::branch_exists;
use crate::api::params::{patch_str, opt_str, req_str};
use crate::api::types::{AppState, Request};
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn branch_json(conn: &Connection, branch_id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        "SELECT b.id, b.name, b.address, b.created_at,
           (SELECT COUNT(*) FROM classes c WHERE c.branch_id = b.id),
           (SELECT COUNT(*) FROM students s WHERE s.branch_id = b.id AND s.active = 1)
         FROM branches b WHERE b.id = ?",
        [branch_id],
        branch_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("branch"))
}

fn branch_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "address": r.get::<_, Option<String>>(2)?,
        "createdAt": r.get::<_, String>(3)?,
        "classCount": r.get::<_, i64>(4)?,
        "studentCount": r.get::<_, i64>(5)?,
    }))
}

fn name_taken(conn: &Connection, name: &str, except: Option<&str>) -> Result<bool, HandlerErr> {
    let hit: Option<String> = conn
        .query_row(
            "SELECT id FROM branches WHERE name = ? COLLATE NOCASE",
            [name],
            |r| r.get(0),
        )
        .optional()?;
    Ok(matches!(hit, Some(id) if Some(id.as_str()) != except))
}

fn branches_list(conn: &Connection, auth: &Auth) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let scope = scope_branch(session, None)?;
    let mut stmt = conn.prepare(
        "SELECT b.id, b.name, b.address, b.created_at,
           (SELECT COUNT(*) FROM classes c WHERE c.branch_id = b.id),
           (SELECT COUNT(*) FROM students s WHERE s.branch_id = b.id AND s.active = 1)
         FROM branches b
         WHERE (?1 IS NULL OR b.id = ?1)
         ORDER BY b.name COLLATE NOCASE",
    )?;
    let branches = stmt
        .query_map([scope], branch_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "branches": branches }))
}

fn branches_create(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    auth.admin()?;
    let name = req_str(params, "name")?;
    if name_taken(conn, &name, None)? {
        return Err(HandlerErr::conflict("a branch with that name already exists"));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO branches(id, name, address, created_at) VALUES(?, ?, ?, ?)",
        (&id, &name, opt_str(params, "address"), db::now_ts()),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "branches", e))?;
    branch_json(conn, &id)
}

fn branches_update(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    auth.admin()?;
    let branch_id = req_str(params, "branchId")?;
    if !branch_exists(conn, &branch_id)? {
        return Err(HandlerErr::not_found("branch"));
    }
    if let Some(name) = opt_str(params, "name") {
        if name_taken(conn, &name, Some(&branch_id))? {
            return Err(HandlerErr::conflict("a branch with that name already exists"));
        }
        conn.execute("UPDATE branches SET name = ? WHERE id = ?", (&name, &branch_id))
            .map_err(|e| HandlerErr::db("db_update_failed", "branches", e))?;
    }
    if let Some(address) = patch_str(params, "address")? {
        conn.execute(
            "UPDATE branches SET address = ? WHERE id = ?",
            (&address, &branch_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", "branches", e))?;
    }
    branch_json(conn, &branch_id)
}

fn branches_delete(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    auth.admin()?;
    let branch_id = req_str(params, "branchId")?;
    if !branch_exists(conn, &branch_id)? {
        return Err(HandlerErr::not_found("branch"));
    }
    let (classes, users, students): (i64, i64, i64) = conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM classes WHERE branch_id = ?1),
           (SELECT COUNT(*) FROM users WHERE branch_id = ?1),
           (SELECT COUNT(*) FROM students WHERE branch_id = ?1)",
        [&branch_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    if classes + users + students > 0 {
        return Err(HandlerErr::conflict("branch still has classes, students or accounts")
            .with_details(json!({ "classes": classes, "users": users, "students": students })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM payments WHERE fee_id IN (SELECT id FROM fees WHERE branch_id = ?)",
        [&branch_id],
    )
    .map_err(|e| HandlerErr::db("db_delete_failed", "payments", e))?;
    tx.execute("DELETE FROM fees WHERE branch_id = ?", [&branch_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "fees", e))?;
    tx.execute(
        "DELETE FROM notification_reads WHERE notification_id IN
           (SELECT id FROM notifications WHERE branch_id = ?)",
        [&branch_id],
    )
    .map_err(|e| HandlerErr::db("db_delete_failed", "notification_reads", e))?;
    tx.execute("DELETE FROM notifications WHERE branch_id = ?", [&branch_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "notifications", e))?;
    tx.execute("DELETE FROM branches WHERE id = ?", [&branch_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "branches", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(branch_id = %branch_id, "branch deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "branches.list" => branches_list(conn, auth),
        "branches.create" => branches_create(conn, auth, &req.params),
        "branches.update" => branches_update(conn, auth, &req.params),
        "branches.delete" => branches_delete(conn, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
