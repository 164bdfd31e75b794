//! News posts, targeted notifications and the contact inbox.

use crate::api::error::{reply, HandlerErr};
use crate::api::guard::{ensure_branch, Auth};
use crate::api::lookup::{branch_exists, class_for, student_for};
use crate::api::params::{limit, opt_bool, opt_str, req_str};
use crate::api::types::{AppState, Request};
use crate::auth::Role;
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use super::site::news_rows;

fn news_create(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    auth.admin()?;
    let title = req_str(params, "title")?;
    let body = req_str(params, "body")?;
    let published = opt_bool(params, "published")?.unwrap_or(false);
    let id = Uuid::new_v4().to_string();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO news(id, title, body, published, created_at, updated_at) VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &title, &body, published as i64, &now, &now),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "news", e))?;
    Ok(json!({
        "id": id,
        "title": title,
        "body": body,
        "published": published,
        "createdAt": now,
        "updatedAt": now,
    }))
}

fn news_update(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    auth.admin()?;
    let news_id = req_str(params, "newsId")?;
    let (mut title, mut body, mut published): (String, String, bool) = conn
        .query_row(
            "SELECT title, body, published FROM news WHERE id = ?",
            [&news_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get::<_, i64>(2)? != 0)),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("news post"))?;
    if let Some(v) = opt_str(params, "title") {
        title = v;
    }
    if let Some(v) = opt_str(params, "body") {
        body = v;
    }
    if let Some(v) = opt_bool(params, "published")? {
        published = v;
    }
    let now = db::now_ts();
    conn.execute(
        "UPDATE news SET title = ?, body = ?, published = ?, updated_at = ? WHERE id = ?",
        (&title, &body, published as i64, &now, &news_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "news", e))?;
    Ok(json!({
        "id": news_id,
        "title": title,
        "body": body,
        "published": published,
        "updatedAt": now,
    }))
}

fn news_delete(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    auth.admin()?;
    let news_id = req_str(params, "newsId")?;
    let n = conn
        .execute("DELETE FROM news WHERE id = ?", [&news_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "news", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("news post"));
    }
    Ok(json!({ "ok": true }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    All,
    Branch,
    Class,
    Student,
}

impl Audience {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Some(Audience::All),
            "branch" => Some(Audience::Branch),
            "class" => Some(Audience::Class),
            "student" => Some(Audience::Student),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Audience::All => "all",
            Audience::Branch => "branch",
            Audience::Class => "class",
            Audience::Student => "student",
        }
    }
}

fn notifications_list(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let own_branch = match session.role {
        Role::SubAdmin => session.branch_id.clone(),
        _ => None,
    };
    let n = limit(params, 50, 500)?;
    let mut stmt = conn.prepare(
        "SELECT n.id, n.title, n.message, n.audience, n.target_id, n.branch_id, u.username, n.created_at,
           (SELECT COUNT(*) FROM notification_reads r WHERE r.notification_id = n.id)
         FROM notifications n LEFT JOIN users u ON u.id = n.created_by
         WHERE (?1 IS NULL OR n.branch_id = ?1 OR n.audience = 'all')
         ORDER BY n.created_at DESC, n.rowid DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map((own_branch, n), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "message": r.get::<_, String>(2)?,
                "audience": r.get::<_, String>(3)?,
                "targetId": r.get::<_, Option<String>>(4)?,
                "branchId": r.get::<_, Option<String>>(5)?,
                "createdBy": r.get::<_, Option<String>>(6)?,
                "createdAt": r.get::<_, String>(7)?,
                "readCount": r.get::<_, i64>(8)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "notifications": rows }))
}

fn notifications_create(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let title = req_str(params, "title")?;
    let message = req_str(params, "message")?;
    let audience = Audience::parse(&req_str(params, "audience")?)
        .ok_or_else(|| HandlerErr::bad_params("audience must be all, branch, class or student"))?;

    let (target_id, branch_id) = match audience {
        Audience::All => {
            if !session.is_admin() {
                return Err(HandlerErr::forbidden("only an admin can notify every branch"));
            }
            (None, None)
        }
        Audience::Branch => {
            let id = req_str(params, "targetId")?;
            ensure_branch(session, &id)?;
            if !branch_exists(conn, &id)? {
                return Err(HandlerErr::not_found("branch"));
            }
            (Some(id.clone()), Some(id))
        }
        Audience::Class => {
            let class = class_for(conn, session, &req_str(params, "targetId")?)?;
            (Some(class.id), Some(class.branch_id))
        }
        Audience::Student => {
            let student = student_for(conn, session, &req_str(params, "targetId")?)?;
            (Some(student.id), Some(student.branch_id))
        }
    };

    let id = Uuid::new_v4().to_string();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO notifications(id, title, message, audience, target_id, branch_id, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &title,
            &message,
            audience.as_str(),
            &target_id,
            &branch_id,
            &session.user_id,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "notifications", e))?;
    tracing::info!(notification_id = %id, audience = audience.as_str(), "notification created");
    Ok(json!({
        "id": id,
        "title": title,
        "message": message,
        "audience": audience.as_str(),
        "targetId": target_id,
        "branchId": branch_id,
        "createdAt": now,
    }))
}

fn notifications_delete(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let id = req_str(params, "notificationId")?;
    let branch: Option<String> = conn
        .query_row("SELECT branch_id FROM notifications WHERE id = ?", [&id], |r| r.get(0))
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("notification"))?;
    match &branch {
        Some(b) => ensure_branch(session, b)?,
        None if !session.is_admin() => {
            return Err(HandlerErr::forbidden("only an admin can remove school-wide notifications"))
        }
        None => {}
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM notification_reads WHERE notification_id = ?", [&id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "notification_reads", e))?;
    tx.execute("DELETE FROM notifications WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "notifications", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn contact_list(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    auth.staff()?;
    let handled = opt_bool(params, "handled")?.map(|b| b as i64);
    let n = limit(params, 100, 1000)?;
    let mut stmt = conn.prepare(
        "SELECT id, name, email, phone, subject, message, handled, created_at
         FROM contact_messages
         WHERE (?1 IS NULL OR handled = ?1)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map((handled, n), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "phone": r.get::<_, Option<String>>(3)?,
                "subject": r.get::<_, Option<String>>(4)?,
                "message": r.get::<_, String>(5)?,
                "handled": r.get::<_, i64>(6)? != 0,
                "createdAt": r.get::<_, String>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "messages": rows }))
}

fn contact_mark_handled(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    auth.staff()?;
    let id = req_str(params, "messageId")?;
    let handled = opt_bool(params, "handled")?.unwrap_or(true);
    let n = conn
        .execute(
            "UPDATE contact_messages SET handled = ? WHERE id = ?",
            (handled as i64, &id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", "contact_messages", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("message"));
    }
    Ok(json!({ "id": id, "handled": handled }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "news.list" => auth
            .staff()
            .and_then(|_| limit(&req.params, 50, 500))
            .and_then(|n| news_rows(conn, false, n))
            .map(|news| json!({ "news": news })),
        "news.create" => news_create(conn, auth, &req.params),
        "news.update" => news_update(conn, auth, &req.params),
        "news.delete" => news_delete(conn, auth, &req.params),
        "notifications.list" => notifications_list(conn, auth, &req.params),
        "notifications.create" => notifications_create(conn, auth, &req.params),
        "notifications.delete" => notifications_delete(conn, auth, &req.params),
        "contact.list" => contact_list(conn, auth, &req.params),
        "contact.markHandled" => contact_mark_handled(conn, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::Audience;

    #[test]
    fn audience_parses_case_insensitively() {
        assert_eq!(Audience::parse("Class"), Some(Audience::Class));
        assert_eq!(Audience::parse(" all "), Some(Audience::All));
        assert_eq!(Audience::parse("parents"), None);
        assert_eq!(Audience::Student.as_str(), "student");
    }
}
