//! Public pages: no session needed.

use crate::api::error::{reply, HandlerErr};
use crate::api::guard::Auth;
use crate::api::params::{limit, opt_str, req_str};
use crate::api::types::{AppState, Request};
use crate::db;
use crate::reconcile::looks_like_email;
use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

use super::settings;

const MAX_MESSAGE_CHARS: usize = 5000;

fn health() -> Result<Value, HandlerErr> {
    Ok(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

fn site_info(conn: &Connection) -> Result<Value, HandlerErr> {
    let school = settings::school_header(conn)?;
    let (term, session) = settings::academic(conn)?;
    let branches: Vec<Value> = conn
        .prepare("SELECT name, address FROM branches ORDER BY name")?
        .query_map([], |r| {
            Ok(json!({
                "name": r.get::<_, String>(0)?,
                "address": r.get::<_, Option<String>>(1)?,
            }))
        })?
        .collect::<Result<_, _>>()?;
    Ok(json!({
        "school": school,
        "currentTerm": term,
        "currentSession": session,
        "branches": branches,
    }))
}

pub(crate) fn news_rows(conn: &Connection, published_only: bool, limit: i64) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, title, body, published, created_at, updated_at
         FROM news
         WHERE (? = 0 OR published = 1)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map((published_only as i64, limit), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "body": r.get::<_, String>(2)?,
                "published": r.get::<_, i64>(3)? != 0,
                "createdAt": r.get::<_, String>(4)?,
                "updatedAt": r.get::<_, String>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn contact_submit(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = req_str(params, "name")?;
    let email = req_str(params, "email")?;
    let message = req_str(params, "message")?;
    if !looks_like_email(&email) {
        return Err(HandlerErr::bad_params("email is not a valid address"));
    }
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(HandlerErr::bad_params(format!(
            "message must be at most {MAX_MESSAGE_CHARS} characters"
        )));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO contact_messages(id, name, email, phone, subject, message, handled, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 0, ?)",
        (
            &id,
            &name,
            &email,
            opt_str(params, "phone"),
            opt_str(params, "subject"),
            &message,
            db::now_ts(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "contact_messages", e))?;
    tracing::info!(message_id = %id, "contact message received");
    Ok(json!({ "messageId": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request, _auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "health" => health(),
        "site.info" => site_info(conn),
        "site.news.list" => limit(&req.params, 10, 100)
            .and_then(|n| news_rows(conn, true, n))
            .map(|news| json!({ "news": news })),
        "site.contact.submit" => contact_submit(conn, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
