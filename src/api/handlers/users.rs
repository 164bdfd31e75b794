//! Staff accounts. Student logins are managed through `students.*`.

use crate::api::error::{reply, HandlerErr};
use crate::api::guard::Auth;
use crate::api::lookup::branch_exists;
use crate::api::params::{opt_str, req_str};
use crate::api::types::{AppState, Request};
use crate::auth::{hash_password, Role};
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use super::auth::{check_new_password, user_profile};

fn parse_staff_role(raw: &str) -> Result<Role, HandlerErr> {
    match Role::parse(raw) {
        Some(r) if r.is_staff() => Ok(r),
        _ => Err(HandlerErr::bad_params("role must be admin or sub_admin")),
    }
}

fn admin_count(conn: &Connection) -> Result<i64, HandlerErr> {
    Ok(conn.query_row("SELECT COUNT(*) FROM users WHERE role = 'admin'", [], |r| r.get(0))?)
}

fn user_role(conn: &Connection, user_id: &str) -> Result<Role, HandlerErr> {
    let raw: String = conn
        .query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| r.get(0))
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("user"))?;
    Role::parse(&raw).ok_or_else(|| HandlerErr::conflict("account has an unknown role"))
}

/// Branch for a staff role: required for sub-admins, dropped for admins.
fn branch_for_role(conn: &Connection, role: Role, branch_id: Option<String>) -> Result<Option<String>, HandlerErr> {
    match role {
        Role::SubAdmin => {
            let b = branch_id.ok_or_else(|| HandlerErr::bad_params("sub_admin requires branchId"))?;
            if !branch_exists(conn, &b)? {
                return Err(HandlerErr::not_found("branch"));
            }
            Ok(Some(b))
        }
        _ => Ok(None),
    }
}

fn users_list(conn: &Connection, auth: &Auth) -> Result<Value, HandlerErr> {
    auth.admin()?;
    let mut stmt = conn.prepare(
        "SELECT u.id, u.username, u.role, u.branch_id, b.name, u.created_at
         FROM users u LEFT JOIN branches b ON b.id = u.branch_id
         WHERE u.role != 'student'
         ORDER BY u.role, u.username COLLATE NOCASE",
    )?;
    let users = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "role": r.get::<_, String>(2)?,
                "branchId": r.get::<_, Option<String>>(3)?,
                "branchName": r.get::<_, Option<String>>(4)?,
                "createdAt": r.get::<_, String>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "users": users }))
}

fn users_create(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    auth.admin()?;
    let username = req_str(params, "username")?;
    if username.chars().count() < 3 {
        return Err(HandlerErr::bad_params("username must be at least 3 characters"));
    }
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    check_new_password(password)?;
    let role = parse_staff_role(&req_str(params, "role")?)?;
    let branch_id = branch_for_role(conn, role, opt_str(params, "branchId"))?;

    let taken = conn
        .query_row(
            "SELECT 1 FROM users WHERE username = ? COLLATE NOCASE",
            [&username],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if taken {
        return Err(HandlerErr::conflict("username already exists"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, username, password_hash, role, branch_id, student_id, created_at)
         VALUES(?, ?, ?, ?, ?, NULL, ?)",
        (
            &id,
            &username,
            hash_password(password),
            role.as_str(),
            &branch_id,
            db::now_ts(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "users", e))?;
    tracing::info!(user_id = %id, role = role.as_str(), "staff account created");
    user_profile(conn, &id)
}

fn users_update(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let me = auth.admin()?;
    let user_id = req_str(params, "userId")?;
    let current_role = user_role(conn, &user_id)?;
    if current_role == Role::Student {
        return Err(HandlerErr::conflict("student accounts are managed through students"));
    }

    let new_role = match opt_str(params, "role") {
        Some(r) => parse_staff_role(&r)?,
        None => current_role,
    };
    if current_role == Role::Admin && new_role != Role::Admin {
        if user_id == me.user_id {
            return Err(HandlerErr::conflict("you cannot demote yourself"));
        }
        if admin_count(conn)? <= 1 {
            return Err(HandlerErr::conflict("cannot demote the last admin"));
        }
    }
    let requested_branch = match opt_str(params, "branchId") {
        Some(b) => Some(b),
        None => conn.query_row("SELECT branch_id FROM users WHERE id = ?", [&user_id], |r| r.get(0))?,
    };
    let branch_id = branch_for_role(conn, new_role, requested_branch)?;
    let password = params.get("password").and_then(|v| v.as_str());
    if let Some(p) = password {
        check_new_password(p)?;
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE users SET role = ?, branch_id = ?, updated_at = ? WHERE id = ?",
        (new_role.as_str(), &branch_id, db::now_ts(), &user_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "users", e))?;
    if let Some(password) = password {
        tx.execute(
            "UPDATE users SET password_hash = ? WHERE id = ?",
            (hash_password(password), &user_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", "users", e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    user_profile(conn, &user_id)
}

fn users_delete(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let me = auth.admin()?;
    let user_id = req_str(params, "userId")?;
    let role = user_role(conn, &user_id)?;
    if role == Role::Student {
        return Err(HandlerErr::conflict("student accounts are removed with the student"));
    }
    if user_id == me.user_id {
        return Err(HandlerErr::conflict("you cannot delete your own account"));
    }
    if role == Role::Admin && admin_count(conn)? <= 1 {
        return Err(HandlerErr::conflict("cannot delete the last admin"));
    }
    conn.execute(
        "UPDATE notifications SET created_by = NULL WHERE created_by = ?",
        [&user_id],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "notifications", e))?;
    conn.execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "users", e))?;
    tracing::info!(user_id = %user_id, "staff account deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "users.list" => users_list(conn, auth),
        "users.create" => users_create(conn, auth, &req.params),
        "users.update" => users_update(conn, auth, &req.params),
        "users.delete" => users_delete(conn, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
