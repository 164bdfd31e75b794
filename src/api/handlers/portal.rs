//! Student self-service. Every method reads the caller's own records only.

use crate::api::error::{reply, HandlerErr};
use crate::api::guard::Auth;
use crate::api::params::{check_session, check_term, opt_i64, opt_str, req_session, req_str, req_term};
use crate::api::types::{AppState, Request};
use crate::db;
use crate::report;
use crate::results::{self, StudentInfo};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

use super::finance::student_statement;
use super::reports::student_card;
use super::settings;
use super::students::student_json;

fn me(conn: &Connection, auth: &Auth) -> Result<StudentInfo, HandlerErr> {
    let (_, student_id) = auth.student()?;
    results::student_info(conn, student_id)?.ok_or_else(|| HandlerErr::not_found("student"))
}

/// Term/session from params, else the current academic period.
fn period(conn: &Connection, params: &Value) -> Result<(i64, String), HandlerErr> {
    let (term, session) = settings::academic(conn)?;
    let term = match opt_i64(params, "term")? {
        Some(t) => check_term(t)?,
        None => term,
    };
    let session = match opt_str(params, "session") {
        Some(s) => check_session(&s)?,
        None => session,
    };
    Ok((term, session))
}

/// Publication is decided by the class the term's results were recorded in.
fn published_for(conn: &Connection, student: &StudentInfo, term: i64, session: &str) -> Result<bool, HandlerErr> {
    if !student.active {
        return Err(HandlerErr::conflict("student is inactive"));
    }
    let class_id = results::term_class_id(conn, student, term, session)?;
    Ok(results::is_published(conn, &class_id, term, session)?)
}

fn portal_profile(conn: &Connection, auth: &Auth) -> Result<Value, HandlerErr> {
    let student = me(conn, auth)?;
    student_json(conn, &student.id)
}

fn portal_scores(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let student = me(conn, auth)?;
    let (term, session) = period(conn, params)?;
    if !published_for(conn, &student, term, &session)? {
        return Ok(json!({
            "term": term,
            "session": session,
            "published": false,
            "subjects": [],
        }));
    }
    let card = student_card(conn, &student, term, &session)?;
    Ok(json!({
        "term": term,
        "session": session,
        "published": true,
        "subjects": card.subjects,
        "total": card.total,
        "average": card.average,
        "grade": card.grade,
        "position": card.position,
        "classSize": card.class_size,
    }))
}

fn portal_report_card(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let student = me(conn, auth)?;
    let term = req_term(params)?;
    let session = req_session(params)?;
    if !published_for(conn, &student, term, &session)? {
        return Err(HandlerErr::forbidden("results for this term are not published yet"));
    }
    let card = student_card(conn, &student, term, &session)?;
    Ok(json!({ "html": report::render_card_html(&card) }))
}

fn portal_fees(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let student = me(conn, auth)?;
    let term = opt_i64(params, "term")?.map(check_term).transpose()?;
    let session = opt_str(params, "session").map(|s| check_session(&s)).transpose()?;
    student_statement(conn, &student, term, session.as_deref())
}

const VISIBLE_TO_STUDENT: &str = "(n.audience = 'all'
       OR (n.audience = 'branch' AND n.target_id = ?1)
       OR (n.audience = 'class' AND n.target_id = ?2)
       OR (n.audience = 'student' AND n.target_id = ?3))";

fn portal_notifications(conn: &Connection, auth: &Auth) -> Result<Value, HandlerErr> {
    let student = me(conn, auth)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT n.id, n.title, n.message, n.audience, n.created_at, r.read_at
         FROM notifications n
         LEFT JOIN notification_reads r ON r.notification_id = n.id AND r.student_id = ?3
         WHERE {VISIBLE_TO_STUDENT}
         ORDER BY n.created_at DESC, n.rowid DESC"
    ))?;
    let rows = stmt
        .query_map((&student.branch_id, &student.class_id, &student.id), |r| {
            let read_at: Option<String> = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "message": r.get::<_, String>(2)?,
                "audience": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
                "read": read_at.is_some(),
                "readAt": read_at,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let unread = rows.iter().filter(|n| n["read"] == json!(false)).count();
    Ok(json!({ "notifications": rows, "unread": unread }))
}

fn portal_mark_read(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let student = me(conn, auth)?;
    let notification_id = req_str(params, "notificationId")?;
    let visible = conn
        .query_row(
            &format!("SELECT 1 FROM notifications n WHERE n.id = ?4 AND {VISIBLE_TO_STUDENT}"),
            (&student.branch_id, &student.class_id, &student.id, &notification_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if !visible {
        return Err(HandlerErr::not_found("notification"));
    }
    conn.execute(
        "INSERT OR IGNORE INTO notification_reads(notification_id, student_id, read_at) VALUES(?, ?, ?)",
        (&notification_id, &student.id, db::now_ts()),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "notification_reads", e))?;
    Ok(json!({ "notificationId": notification_id, "read": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "portal.profile" => portal_profile(conn, auth),
        "portal.scores" => portal_scores(conn, auth, &req.params),
        "portal.reportCard" => portal_report_card(conn, auth, &req.params),
        "portal.fees" => portal_fees(conn, auth, &req.params),
        "portal.notifications" => portal_notifications(conn, auth),
        "portal.notifications.markRead" => portal_mark_read(conn, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
