use crate::api::error::{reply, HandlerErr};
use crate::api::guard::Auth;
use crate::api::params::req_str;
use crate::api::types::{AppState, Request};
use crate::auth::{self, Role};
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

pub const MIN_PASSWORD_CHARS: usize = 6;

struct UserRow {
    id: String,
    password_hash: String,
    role: String,
    branch_id: Option<String>,
    student_id: Option<String>,
    student_active: Option<bool>,
}

fn find_login(conn: &Connection, identifier: &str) -> Result<Option<UserRow>, HandlerErr> {
    let map = |r: &rusqlite::Row<'_>| {
        Ok(UserRow {
            id: r.get(0)?,
            password_hash: r.get(1)?,
            role: r.get(2)?,
            branch_id: r.get(3)?,
            student_id: r.get(4)?,
            student_active: r.get::<_, Option<i64>>(5)?.map(|a| a != 0),
        })
    };
    let by_username = conn
        .query_row(
            "SELECT u.id, u.password_hash, u.role, u.branch_id, u.student_id, s.active
             FROM users u LEFT JOIN students s ON s.id = u.student_id
             WHERE u.username = ? COLLATE NOCASE",
            [identifier],
            map,
        )
        .optional()?;
    if by_username.is_some() {
        return Ok(by_username);
    }
    // Students may also sign in with their SOWA ID.
    Ok(conn
        .query_row(
            "SELECT u.id, u.password_hash, u.role, u.branch_id, u.student_id, s.active
             FROM students s JOIN users u ON u.student_id = s.id
             WHERE s.sowa_id = ? COLLATE NOCASE",
            [identifier],
            map,
        )
        .optional()?)
}

pub fn user_profile(conn: &Connection, user_id: &str) -> Result<Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT u.id, u.username, u.role, u.branch_id, b.name, u.student_id, u.created_at
             FROM users u LEFT JOIN branches b ON b.id = u.branch_id
             WHERE u.id = ?",
            [user_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "username": r.get::<_, String>(1)?,
                    "role": r.get::<_, String>(2)?,
                    "branchId": r.get::<_, Option<String>>(3)?,
                    "branchName": r.get::<_, Option<String>>(4)?,
                    "studentId": r.get::<_, Option<String>>(5)?,
                    "createdAt": r.get::<_, String>(6)?,
                }))
            },
        )
        .optional()?;
    row.ok_or_else(|| HandlerErr::not_found("user"))
}

fn login(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let identifier = req_str(params, "identifier")?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;

    let denied = || HandlerErr::unauthorized("invalid credentials");
    let user = find_login(&state.db, &identifier)?.ok_or_else(denied)?;
    if !auth::verify_password(&user.password_hash, password) {
        tracing::warn!(identifier = %identifier, "failed sign-in");
        return Err(denied());
    }
    let role = Role::parse(&user.role).ok_or_else(denied)?;
    if role == Role::Student && user.student_active != Some(true) {
        return Err(HandlerErr::unauthorized("account is inactive"));
    }

    let now = chrono::Utc::now().timestamp();
    let (token, claims) = state.tokens.issue(
        &user.id,
        role,
        user.branch_id.clone(),
        user.student_id.clone(),
        now,
    )
    .map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    tracing::info!(user_id = %user.id, role = role.as_str(), "signed in");
    Ok(json!({
        "token": token,
        "expiresAt": claims.exp,
        "user": user_profile(&state.db, &user.id)?,
    }))
}

fn logout(state: &mut AppState, auth: &Auth) -> Result<Value, HandlerErr> {
    let session = auth.session()?;
    let now = chrono::Utc::now().timestamp();
    state
        .revoked
        .revoke(&session.token_id, session.expires_at, now);
    tracing::info!(user_id = %session.user_id, revoked = state.revoked.len(), "signed out");
    Ok(json!({ "ok": true }))
}

fn me(conn: &Connection, auth: &Auth) -> Result<Value, HandlerErr> {
    let session = auth.session()?;
    let mut profile = user_profile(conn, &session.user_id)?;
    if let Some(student_id) = &session.student_id {
        if let Some(student) = crate::results::student_info(conn, student_id)? {
            let class = crate::results::class_info(conn, &student.class_id)?;
            profile["student"] = json!({
                "id": student.id,
                "sowaId": student.sowa_id,
                "firstName": student.first_name,
                "lastName": student.last_name,
                "classId": student.class_id,
                "className": class.map(|c| c.name),
            });
        }
    }
    Ok(profile)
}

pub fn check_new_password(password: &str) -> Result<(), HandlerErr> {
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {MIN_PASSWORD_CHARS} characters"
        )));
    }
    Ok(())
}

fn change_password(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.session()?;
    let current = params
        .get("currentPassword")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing currentPassword"))?;
    let new = params
        .get("newPassword")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing newPassword"))?;
    check_new_password(new)?;

    let stored: String = conn.query_row(
        "SELECT password_hash FROM users WHERE id = ?",
        [&session.user_id],
        |r| r.get(0),
    )?;
    if !auth::verify_password(&stored, current) {
        return Err(HandlerErr::unauthorized("current password is incorrect"));
    }
    conn.execute(
        "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?",
        (auth::hash_password(new), db::now_ts(), &session.user_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "users", e))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let result = match req.method.as_str() {
        "auth.login" => login(state, &req.params),
        "auth.logout" => logout(state, auth),
        "auth.me" => me(&state.db, auth),
        "auth.changePassword" => change_password(&state.db, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
