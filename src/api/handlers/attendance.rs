use crate::api::error::{reply, HandlerErr};
use crate::api::guard::Auth;
use crate::api::lookup::class_for;
use crate::api::params::{check_session, check_term, opt_i64, opt_str, req_array, req_date, req_session, req_str, req_term};
use crate::api::types::{AppState, Request};
use crate::results;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

use super::settings;

const STATUSES: [&str; 4] = ["present", "absent", "late", "excused"];

fn attendance_get(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = req_str(params, "classId")?;
    class_for(conn, session, &class_id)?;
    let date = req_date(params, "date")?.format("%Y-%m-%d").to_string();

    let mut stmt = conn.prepare(
        "SELECT student_id, status FROM attendance_records WHERE class_id = ? AND date = ?",
    )?;
    let marked: HashMap<String, String> = stmt
        .query_map((&class_id, &date), |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<_, _>>()?;

    let rows: Vec<Value> = results::load_roster(conn, &class_id, false)?
        .into_iter()
        .map(|s| {
            json!({
                "studentId": s.id,
                "sowaId": s.sowa_id,
                "name": s.display_name(),
                "status": marked.get(&s.id),
            })
        })
        .collect();
    Ok(json!({ "classId": class_id, "date": date, "rows": rows }))
}

fn attendance_mark(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = req_str(params, "classId")?;
    class_for(conn, session, &class_id)?;
    let date = req_date(params, "date")?.format("%Y-%m-%d").to_string();
    let (current_term, current_session) = settings::academic(conn)?;
    let term = match opt_i64(params, "term")? {
        Some(t) => check_term(t)?,
        None => current_term,
    };
    let academic_session = match opt_str(params, "session") {
        Some(s) => check_session(&s)?,
        None => current_session,
    };
    let entries = req_array(params, "entries")?;

    let enrolled: HashSet<String> = results::load_roster(conn, &class_id, true)?
        .into_iter()
        .map(|s| s.id)
        .collect();
    let mut planned: Vec<(String, Option<String>)> = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let student_id = entry
            .get("studentId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HandlerErr::bad_params("entry is missing studentId").with_details(json!({ "index": index }))
            })?;
        if !enrolled.contains(student_id) {
            return Err(HandlerErr::not_found("student in this class")
                .with_details(json!({ "index": index, "studentId": student_id })));
        }
        let status = match entry.get("status") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let s = v.as_str().unwrap_or("").trim().to_ascii_lowercase();
                if !STATUSES.contains(&s.as_str()) {
                    return Err(HandlerErr::bad_params(
                        "status must be present, absent, late, excused or null",
                    )
                    .with_details(json!({ "index": index, "studentId": student_id })));
                }
                Some(s)
            }
        };
        planned.push((student_id.to_string(), status));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut marked = 0usize;
    let mut cleared = 0usize;
    for (student_id, status) in &planned {
        match status {
            Some(status) => {
                tx.execute(
                    "INSERT INTO attendance_records(student_id, date, class_id, term, session, status)
                     VALUES(?, ?, ?, ?, ?, ?)
                     ON CONFLICT(student_id, date) DO UPDATE SET
                       class_id = excluded.class_id,
                       term = excluded.term,
                       session = excluded.session,
                       status = excluded.status",
                    (student_id, &date, &class_id, term, &academic_session, status),
                )
                .map_err(|e| HandlerErr::db("db_update_failed", "attendance_records", e))?;
                marked += 1;
            }
            None => {
                tx.execute(
                    "DELETE FROM attendance_records WHERE student_id = ? AND date = ?",
                    (student_id, &date),
                )
                .map_err(|e| HandlerErr::db("db_delete_failed", "attendance_records", e))?;
                cleared += 1;
            }
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({
        "date": date,
        "term": term,
        "session": academic_session,
        "marked": marked,
        "cleared": cleared,
    }))
}

fn attendance_summary(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = req_str(params, "classId")?;
    class_for(conn, session, &class_id)?;
    let term = req_term(params)?;
    let academic_session = req_session(params)?;
    let (days_opened, counts) = results::attendance_summary(conn, &class_id, term, &academic_session)?;
    let rows: Vec<Value> = results::load_roster(conn, &class_id, false)?
        .into_iter()
        .map(|s| {
            let c = counts.get(&s.id).copied().unwrap_or_default();
            json!({
                "studentId": s.id,
                "sowaId": s.sowa_id,
                "name": s.display_name(),
                "present": c.present,
                "absent": c.absent,
                "late": c.late,
                "excused": c.excused,
                "attended": c.attended(),
            })
        })
        .collect();
    Ok(json!({
        "classId": class_id,
        "term": term,
        "session": academic_session,
        "daysOpened": days_opened,
        "rows": rows,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "attendance.get" => attendance_get(conn, auth, &req.params),
        "attendance.mark" => attendance_mark(conn, auth, &req.params),
        "attendance.summary" => attendance_summary(conn, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
