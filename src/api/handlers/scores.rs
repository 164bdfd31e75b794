use crate::api::error::{reply, HandlerErr};
use crate::api::guard::Auth;
use crate::api::lookup::{class_for, subject_for};
use crate::api::params::{req_array, req_bool, req_session, req_str, req_term, upload};
use crate::api::types::{AppState, Request};
use crate::calc::{PartEdit, ScoreField, ScoreParts, ScorePatch};
use crate::db;
use crate::reconcile;
use crate::results::{self, ClassResults};
use crate::workbook;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashSet;
use uuid::Uuid;

use super::settings;

pub const MAX_SAVE_ENTRIES: usize = 5000;

/// Upserts one score row; a row with every part cleared is removed.
pub fn write_score(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    class_id: &str,
    term: i64,
    session: &str,
    parts: ScoreParts,
) -> Result<(), HandlerErr> {
    if parts.is_empty() {
        conn.execute(
            "DELETE FROM scores WHERE student_id = ? AND subject_id = ? AND term = ? AND session = ?",
            (student_id, subject_id, term, session),
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", "scores", e))?;
        return Ok(());
    }
    conn.execute(
        "INSERT INTO scores(id, student_id, subject_id, class_id, term, session, ca1, ca2, exam, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, term, session) DO UPDATE SET
           class_id = excluded.class_id,
           ca1 = excluded.ca1,
           ca2 = excluded.ca2,
           exam = excluded.exam,
           updated_at = excluded.updated_at",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            student_id,
            subject_id,
            class_id,
            term,
            session,
            parts.ca1,
            parts.ca2,
            parts.exam,
            db::now_ts(),
        ],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "scores", e))?;
    Ok(())
}

fn scores_get(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = req_str(params, "classId")?;
    class_for(conn, session, &class_id)?;
    let (subject, _) = subject_for(conn, session, &req_str(params, "subjectId")?)?;
    if subject.class_id != class_id {
        return Err(HandlerErr::bad_params("subject does not belong to this class"));
    }
    let term = req_term(params)?;
    let academic_session = req_session(params)?;

    let results = ClassResults::load(conn, &class_id, term, &academic_session)?;
    let scale = settings::grading_scale(conn)?;
    let positions = results.subject_positions(&subject.id);
    let rows: Vec<Value> = results
        .students
        .iter()
        .map(|s| {
            let parts = results.parts(&s.id, &subject.id).unwrap_or_default();
            let total = parts.total();
            let band = total.and_then(|t| scale.grade_for(t));
            json!({
                "studentId": s.id,
                "sowaId": s.sowa_id,
                "name": s.display_name(),
                "ca1": parts.ca1,
                "ca2": parts.ca2,
                "exam": parts.exam,
                "total": total,
                "grade": band.map(|b| b.grade.clone()),
                "remark": band.map(|b| b.remark.clone()),
                "position": positions.get(&s.id),
            })
        })
        .collect();
    Ok(json!({
        "classId": class_id,
        "subjectId": subject.id,
        "subjectName": subject.name,
        "term": term,
        "session": academic_session,
        "published": results::is_published(conn, &class_id, term, &academic_session)?,
        "stats": results.subject_stats(&subject.id),
        "rows": rows,
    }))
}

fn part_edit(entry: &Value, field: ScoreField) -> Result<PartEdit, String> {
    match entry.get(field.key()) {
        None => Ok(PartEdit::Keep),
        Some(Value::Null) => Ok(PartEdit::Set(None)),
        Some(v) => v
            .as_f64()
            .map(|x| PartEdit::Set(Some(x)))
            .ok_or_else(|| format!("{} must be a number or null", field.key())),
    }
}

fn scores_save(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = req_str(params, "classId")?;
    class_for(conn, session, &class_id)?;
    let (subject, _) = subject_for(conn, session, &req_str(params, "subjectId")?)?;
    if subject.class_id != class_id {
        return Err(HandlerErr::bad_params("subject does not belong to this class"));
    }
    let term = req_term(params)?;
    let academic_session = req_session(params)?;
    let entries = req_array(params, "entries")?;
    if entries.len() > MAX_SAVE_ENTRIES {
        return Err(HandlerErr::bad_params(format!(
            "at most {MAX_SAVE_ENTRIES} entries per save"
        ))
        .with_details(json!({ "entries": entries.len() })));
    }

    let existing = results::load_scores(conn, &class_id, term, &academic_session)?;
    // Students who have since moved on can still have this term corrected here.
    let enrolled: HashSet<String> = results::load_roster(conn, &class_id, true)?
        .into_iter()
        .map(|s| s.id)
        .chain(existing.keys().map(|(student_id, _)| student_id.clone()))
        .collect();

    let mut errors = Vec::new();
    let mut writes: Vec<(String, ScoreParts)> = Vec::new();
    let mut unchanged = 0usize;
    for (index, entry) in entries.iter().enumerate() {
        let student_id = entry.get("studentId").and_then(|v| v.as_str()).unwrap_or("");
        let planned = (|| -> Result<Option<ScoreParts>, HandlerErr> {
            if !enrolled.contains(student_id) {
                return Err(HandlerErr::not_found("student in this class"));
            }
            let mut patch = ScorePatch::default();
            for field in ScoreField::ALL {
                patch.set_edit(field, part_edit(entry, field).map_err(HandlerErr::bad_params)?);
            }
            let current = existing
                .get(&(student_id.to_string(), subject.id.clone()))
                .copied()
                .unwrap_or_default();
            let next = patch.apply(current)?;
            Ok((next != current).then_some(next))
        })();
        match planned {
            Ok(Some(parts)) => writes.push((student_id.to_string(), parts)),
            Ok(None) => unchanged += 1,
            Err(e) => errors.push(json!({
                "index": index,
                "studentId": student_id,
                "code": e.code,
                "message": e.message,
                "details": e.details,
            })),
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (student_id, parts) in &writes {
        write_score(&tx, student_id, &subject.id, &class_id, term, &academic_session, *parts)?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({
        "saved": writes.len(),
        "unchanged": unchanged,
        "errors": errors,
    }))
}

fn scores_upload(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = req_str(params, "classId")?;
    class_for(conn, session, &class_id)?;
    let term = req_term(params)?;
    let academic_session = req_session(params)?;
    let (file_name, bytes) = upload(params)?;
    let book = workbook::load(&file_name, bytes)
        .map_err(|e| HandlerErr::new("upload_failed", format!("{e:#}")))?;

    let results = ClassResults::load(conn, &class_id, term, &academic_session)?;
    let plan = reconcile::plan_score_upload(&book, &results.subjects, &results.roster(), &results.scores);

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for w in &plan.writes {
        write_score(&tx, &w.student_id, &w.subject_id, &class_id, term, &academic_session, w.parts)?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(
        class_id = %class_id,
        sheets = plan.sheets.len(),
        rows_written = plan.writes.len(),
        row_errors = plan.errors.len(),
        "score upload processed"
    );
    Ok(json!({
        "rowsWritten": plan.writes.len(),
        "sheets": plan.sheets,
        "errors": plan.errors,
    }))
}

fn scores_template(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = req_str(params, "classId")?;
    let class = class_for(conn, session, &class_id)?;
    let term = req_term(params)?;
    let academic_session = req_session(params)?;
    let results = ClassResults::load(conn, &class_id, term, &academic_session)?;
    let book = reconcile::score_template(&results.subjects, &results.roster(), &results.scores);
    // One CSV per subject; uploading a file back matches it by its name.
    let files: Vec<Value> = book
        .sheets
        .iter()
        .map(|sheet| {
            json!({
                "sheet": sheet.name,
                "fileName": format!("{}.csv", sheet.name),
                "csv": sheet.to_csv(),
            })
        })
        .collect();
    Ok(json!({
        "className": class.name,
        "term": term,
        "session": academic_session,
        "files": files,
    }))
}

fn scores_publish(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = req_str(params, "classId")?;
    class_for(conn, session, &class_id)?;
    let term = req_term(params)?;
    let academic_session = req_session(params)?;
    let published = req_bool(params, "published")?;
    conn.execute(
        "INSERT INTO score_publications(class_id, term, session, published, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(class_id, term, session) DO UPDATE SET
           published = excluded.published,
           updated_at = excluded.updated_at",
        (&class_id, term, &academic_session, published as i64, db::now_ts()),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "score_publications", e))?;
    tracing::info!(class_id = %class_id, term, session = %academic_session, published, "score visibility changed");
    Ok(json!({
        "classId": class_id,
        "term": term,
        "session": academic_session,
        "published": published,
    }))
}

fn scores_publications(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = req_str(params, "classId")?;
    class_for(conn, session, &class_id)?;
    let mut stmt = conn.prepare(
        "SELECT term, session, published, updated_at FROM score_publications
         WHERE class_id = ? ORDER BY session DESC, term DESC",
    )?;
    let rows = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "term": r.get::<_, i64>(0)?,
                "session": r.get::<_, String>(1)?,
                "published": r.get::<_, i64>(2)? != 0,
                "updatedAt": r.get::<_, String>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classId": class_id, "publications": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "scores.get" => scores_get(conn, auth, &req.params),
        "scores.save" => scores_save(conn, auth, &req.params),
        "scores.upload" => scores_upload(conn, auth, &req.params),
        "scores.template" => scores_template(conn, auth, &req.params),
        "scores.publish" => scores_publish(conn, auth, &req.params),
        "scores.publications" => scores_publications(conn, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
