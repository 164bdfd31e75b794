use crate::api::error::{reply, HandlerErr};
use crate::api::guard::{scope_branch, Auth};
use crate::api::params::opt_str;
use crate::api::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

use super::finance::{fee_totals, money};
use super::settings;

fn count(conn: &Connection, sql: &str, branch: Option<&str>) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(sql, [branch], |r| r.get(0))?)
}

fn dashboard_stats(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let branch = scope_branch(session, opt_str(params, "branchId"))?;
    let branch = branch.as_deref();

    let students = count(
        conn,
        "SELECT COUNT(*) FROM students WHERE active = 1 AND (?1 IS NULL OR branch_id = ?1)",
        branch,
    )?;
    let inactive_students = count(
        conn,
        "SELECT COUNT(*) FROM students WHERE active = 0 AND (?1 IS NULL OR branch_id = ?1)",
        branch,
    )?;
    let classes = count(
        conn,
        "SELECT COUNT(*) FROM classes WHERE (?1 IS NULL OR branch_id = ?1)",
        branch,
    )?;
    let subjects = count(
        conn,
        "SELECT COUNT(*) FROM subjects s JOIN classes c ON c.id = s.class_id
         WHERE (?1 IS NULL OR c.branch_id = ?1)",
        branch,
    )?;
    // The contact inbox is school-wide.
    let unread_messages: i64 = conn.query_row(
        "SELECT COUNT(*) FROM contact_messages WHERE handled = 0",
        [],
        |r| r.get(0),
    )?;

    let (term, academic_session) = settings::academic(conn)?;
    let (expected, collected) = fee_totals(conn, branch, term, &academic_session)?;
    Ok(json!({
        "branchId": branch,
        "students": students,
        "inactiveStudents": inactive_students,
        "classes": classes,
        "subjects": subjects,
        "unreadMessages": unread_messages,
        "fees": {
            "term": term,
            "session": academic_session,
            "expected": expected,
            "collected": collected,
            "outstanding": money((expected - collected).max(0.0)),
        },
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "dashboard.stats" => dashboard_stats(conn, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
