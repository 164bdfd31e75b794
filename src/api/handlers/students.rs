use crate::api::error::{reply, HandlerErr};
use crate::api::guard::{scope_branch, Auth};
use crate::api::lookup::{class_for, student_for};
use crate::api::params::{opt_bool, opt_str, parse_date, patch_str, req_bool, req_session, req_str, upload};
use crate::api::types::{AppState, Request};
use crate::auth::hash_password;
use crate::calc::PromotionVerdict;
use crate::db;
use crate::reconcile::{self, looks_like_email, normalize_gender, NewStudent, RowError};
use crate::results::{self, ClassInfo};
use crate::workbook;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use super::auth::check_new_password;
use super::settings;

const STUDENT_SELECT: &str = "SELECT
       s.id, s.sowa_id, s.first_name, s.last_name, s.gender, s.date_of_birth, s.email,
       s.guardian_name, s.guardian_phone, s.address, s.active,
       s.class_id, c.name, s.branch_id, b.name, u.username, s.created_at, s.updated_at
     FROM students s
     JOIN classes c ON c.id = s.class_id
     JOIN branches b ON b.id = s.branch_id
     LEFT JOIN users u ON u.student_id = s.id";

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "sowaId": r.get::<_, String>(1)?,
        "firstName": r.get::<_, String>(2)?,
        "lastName": r.get::<_, String>(3)?,
        "gender": r.get::<_, Option<String>>(4)?,
        "dateOfBirth": r.get::<_, Option<String>>(5)?,
        "email": r.get::<_, Option<String>>(6)?,
        "guardianName": r.get::<_, Option<String>>(7)?,
        "guardianPhone": r.get::<_, Option<String>>(8)?,
        "address": r.get::<_, Option<String>>(9)?,
        "active": r.get::<_, i64>(10)? != 0,
        "classId": r.get::<_, String>(11)?,
        "className": r.get::<_, String>(12)?,
        "branchId": r.get::<_, String>(13)?,
        "branchName": r.get::<_, String>(14)?,
        "username": r.get::<_, Option<String>>(15)?,
        "createdAt": r.get::<_, String>(16)?,
        "updatedAt": r.get::<_, Option<String>>(17)?,
    }))
}

pub fn student_json(conn: &Connection, student_id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        &format!("{STUDENT_SELECT} WHERE s.id = ?"),
        [student_id],
        student_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("student"))
}

fn username_taken(conn: &Connection, username: &str, except_student: Option<&str>) -> Result<bool, HandlerErr> {
    let hit: Option<Option<String>> = conn
        .query_row(
            "SELECT student_id FROM users WHERE username = ? COLLATE NOCASE",
            [username],
            |r| r.get(0),
        )
        .optional()?;
    Ok(match hit {
        None => false,
        Some(owner) => except_student.map_or(true, |me| owner.as_deref() != Some(me)),
    })
}

fn check_email(email: &str) -> Result<(), HandlerErr> {
    if looks_like_email(email) {
        Ok(())
    } else {
        Err(HandlerErr::bad_params(format!("'{email}' is not an email address")))
    }
}

/// Inserts the student and their login. Returns `(student_id, sowa_id)`.
fn create_student(
    conn: &Connection,
    class: &ClassInfo,
    s: &NewStudent,
    password: Option<&str>,
) -> Result<(String, String), HandlerErr> {
    let (prefix, default_password) = settings::student_defaults(conn)?;
    if let Some(email) = &s.email {
        check_email(email)?;
        if username_taken(conn, email, None)? {
            return Err(HandlerErr::conflict(format!("{email} is already used by another account")));
        }
    }
    let password = password.unwrap_or(&default_password);
    check_new_password(password)?;

    let seq = db::next_sowa_seq(conn)?;
    let sowa_id = db::format_sowa_id(&prefix, seq);
    let id = Uuid::new_v4().to_string();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO students(id, sowa_id, sowa_seq, branch_id, class_id, first_name, last_name,
           gender, date_of_birth, email, guardian_name, guardian_phone, address, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        rusqlite::params![
            &id,
            &sowa_id,
            seq,
            &class.branch_id,
            &class.id,
            &s.first_name,
            &s.last_name,
            &s.gender,
            &s.date_of_birth,
            &s.email,
            &s.guardian_name,
            &s.guardian_phone,
            &s.address,
            &now,
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "students", e))?;
    conn.execute(
        "INSERT INTO users(id, username, password_hash, role, branch_id, student_id, created_at)
         VALUES(?, ?, ?, 'student', NULL, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            s.email.as_deref().unwrap_or(&sowa_id),
            hash_password(password),
            &id,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "users", e))?;
    Ok((id, sowa_id))
}

fn new_student_from_params(params: &Value) -> Result<NewStudent, HandlerErr> {
    let gender = match opt_str(params, "gender") {
        Some(g) => Some(normalize_gender(&g).map_err(HandlerErr::bad_params)?),
        None => None,
    };
    let date_of_birth = match opt_str(params, "dateOfBirth") {
        Some(d) => Some(parse_date(&d, "dateOfBirth")?.format("%Y-%m-%d").to_string()),
        None => None,
    };
    Ok(NewStudent {
        first_name: req_str(params, "firstName")?,
        last_name: req_str(params, "lastName")?,
        gender,
        date_of_birth,
        email: opt_str(params, "email"),
        guardian_name: opt_str(params, "guardianName"),
        guardian_phone: opt_str(params, "guardianPhone"),
        address: opt_str(params, "address"),
    })
}

fn students_list(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = opt_str(params, "classId");
    if let Some(c) = &class_id {
        class_for(conn, session, c)?;
    }
    let branch = scope_branch(session, opt_str(params, "branchId"))?;
    let include_inactive = opt_bool(params, "includeInactive")?.unwrap_or(false);
    let search = opt_str(params, "search").map(|s| format!("%{}%", s.to_lowercase()));

    let mut stmt = conn.prepare(&format!(
        "{STUDENT_SELECT}
         WHERE (?1 IS NULL OR s.class_id = ?1)
           AND (?2 IS NULL OR s.branch_id = ?2)
           AND (?3 OR s.active = 1)
           AND (?4 IS NULL
                OR lower(s.first_name) LIKE ?4
                OR lower(s.last_name) LIKE ?4
                OR lower(s.last_name || ' ' || s.first_name) LIKE ?4
                OR lower(s.first_name || ' ' || s.last_name) LIKE ?4
                OR lower(s.sowa_id) LIKE ?4)
         ORDER BY s.last_name COLLATE NOCASE, s.first_name COLLATE NOCASE, s.sowa_seq"
    ))?;
    let students = stmt
        .query_map(
            rusqlite::params![class_id, branch, include_inactive, search],
            student_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn students_get(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let student_id = req_str(params, "studentId")?;
    student_for(conn, session, &student_id)?;
    student_json(conn, &student_id)
}

fn students_create(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class = class_for(conn, session, &req_str(params, "classId")?)?;
    let new = new_student_from_params(params)?;
    let password = params.get("password").and_then(|v| v.as_str());

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let (id, sowa_id) = create_student(&tx, &class, &new, password)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(student_id = %id, sowa_id = %sowa_id, "student created");
    student_json(conn, &id)
}

fn students_update(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let student_id = req_str(params, "studentId")?;
    let student = student_for(conn, session, &student_id)?;

    let mut sets: Vec<(&str, Option<String>)> = Vec::new();
    for (key, column) in [("firstName", "first_name"), ("lastName", "last_name")] {
        if params.get(key).is_some() {
            sets.push((column, Some(req_str(params, key)?)));
        }
    }
    if let Some(g) = patch_str(params, "gender")? {
        let g = g
            .map(|g| normalize_gender(&g).map_err(HandlerErr::bad_params))
            .transpose()?;
        sets.push(("gender", g));
    }
    if let Some(d) = patch_str(params, "dateOfBirth")? {
        let d = d
            .map(|d| parse_date(&d, "dateOfBirth").map(|d| d.format("%Y-%m-%d").to_string()))
            .transpose()?;
        sets.push(("date_of_birth", d));
    }
    for (key, column) in [
        ("guardianName", "guardian_name"),
        ("guardianPhone", "guardian_phone"),
        ("address", "address"),
    ] {
        if let Some(v) = patch_str(params, key)? {
            sets.push((column, v));
        }
    }
    let email_patch = patch_str(params, "email")?;
    if let Some(Some(email)) = &email_patch {
        check_email(email)?;
        if username_taken(conn, email, Some(&student_id))? {
            return Err(HandlerErr::conflict(format!("{email} is already used by another account")));
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (column, value) in &sets {
        tx.execute(
            &format!("UPDATE students SET {column} = ? WHERE id = ?"),
            (value, &student_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", "students", e))?;
    }
    if let Some(email) = email_patch {
        tx.execute(
            "UPDATE students SET email = ? WHERE id = ?",
            (&email, &student_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", "students", e))?;
        // The login follows the email, or falls back to the SOWA ID.
        tx.execute(
            "UPDATE users SET username = ?, updated_at = ? WHERE student_id = ?",
            (
                email.as_deref().unwrap_or(&student.sowa_id),
                db::now_ts(),
                &student_id,
            ),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", "users", e))?;
    }
    tx.execute(
        "UPDATE students SET updated_at = ? WHERE id = ?",
        (db::now_ts(), &student_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "students", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    student_json(conn, &student_id)
}

fn students_set_active(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let student_id = req_str(params, "studentId")?;
    student_for(conn, session, &student_id)?;
    let active = req_bool(params, "active")?;
    conn.execute(
        "UPDATE students SET active = ?, updated_at = ? WHERE id = ?",
        (active as i64, db::now_ts(), &student_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "students", e))?;
    student_json(conn, &student_id)
}

fn students_transfer(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let student_id = req_str(params, "studentId")?;
    let student = student_for(conn, session, &student_id)?;
    let target = class_for(conn, session, &req_str(params, "classId")?)?;
    if target.id == student.class_id {
        return Err(HandlerErr::bad_params("student is already in that class"));
    }
    conn.execute(
        "UPDATE students SET class_id = ?, branch_id = ?, updated_at = ? WHERE id = ?",
        (&target.id, &target.branch_id, db::now_ts(), &student_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "students", e))?;
    tracing::info!(student_id = %student_id, from = %student.class_id, to = %target.id, "student transferred");
    student_json(conn, &student_id)
}

fn students_delete(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let student_id = req_str(params, "studentId")?;
    student_for(conn, session, &student_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    let steps: [(&str, &str); 9] = [
        ("scores", "DELETE FROM scores WHERE student_id = ?"),
        ("report_remarks", "DELETE FROM report_remarks WHERE student_id = ?"),
        ("attendance_records", "DELETE FROM attendance_records WHERE student_id = ?"),
        ("payments", "DELETE FROM payments WHERE student_id = ?"),
        ("notification_reads", "DELETE FROM notification_reads WHERE student_id = ?"),
        (
            "notification_reads",
            "DELETE FROM notification_reads WHERE notification_id IN
               (SELECT id FROM notifications WHERE audience = 'student' AND target_id = ?)",
        ),
        (
            "notifications",
            "DELETE FROM notifications WHERE audience = 'student' AND target_id = ?",
        ),
        ("users", "DELETE FROM users WHERE student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ];
    for (table, sql) in steps {
        tx.execute(sql, [&student_id])
            .map_err(|e| HandlerErr::db("db_delete_failed", table, e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(student_id = %student_id, "student deleted");
    Ok(json!({ "ok": true }))
}

fn students_reset_password(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let student_id = req_str(params, "studentId")?;
    student_for(conn, session, &student_id)?;
    let (_, default_password) = settings::student_defaults(conn)?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or(default_password);
    check_new_password(&password)?;
    let changed = conn
        .execute(
            "UPDATE users SET password_hash = ?, updated_at = ? WHERE student_id = ?",
            (hash_password(&password), db::now_ts(), &student_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", "users", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("student login"));
    }
    Ok(json!({ "ok": true }))
}

fn students_bulk_upload(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class = class_for(conn, session, &req_str(params, "classId")?)?;
    let (file_name, bytes) = upload(params)?;
    let book = workbook::load(&file_name, bytes)
        .map_err(|e| HandlerErr::new("upload_failed", format!("{e:#}")))?;
    let sheet = book
        .sheets
        .first()
        .ok_or_else(|| HandlerErr::new("upload_failed", "workbook has no sheets"))?;
    let plan = reconcile::plan_student_upload(sheet);
    if !plan.header_found {
        return Err(HandlerErr::bad_params(
            "no header row with First Name and Last Name columns in the first sheet",
        ));
    }

    let mut errors: Vec<RowError> = plan.errors;
    let mut created = Vec::new();
    for (row, new) in &plan.rows {
        // One transaction per row: a bad row never undoes the good ones.
        let outcome = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))
            .and_then(|tx| {
                let ids = create_student(&tx, &class, new, None)?;
                tx.commit()
                    .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
                Ok(ids)
            });
        match outcome {
            Ok((id, sowa_id)) => created.push(json!({
                "row": row,
                "studentId": id,
                "sowaId": sowa_id,
                "name": format!("{} {}", new.last_name, new.first_name),
            })),
            Err(e) => errors.push(RowError {
                sheet: sheet.name.clone(),
                row: *row,
                student: Some(format!("{} {}", new.last_name, new.first_name)),
                message: e.message,
            }),
        }
    }
    errors.sort_by_key(|e| e.row);
    tracing::info!(
        class_id = %class.id,
        created = created.len(),
        failed = errors.len(),
        "student upload processed"
    );
    Ok(json!({
        "createdCount": created.len(),
        "created": created,
        "errors": errors,
    }))
}

fn students_promote(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let from = class_for(conn, session, &req_str(params, "fromClassId")?)?;
    let to = class_for(conn, session, &req_str(params, "toClassId")?)?;
    if from.id == to.id {
        return Err(HandlerErr::bad_params("source and target class are the same"));
    }
    let academic_session = req_session(params)?;
    let dry_run = opt_bool(params, "dryRun")?.unwrap_or(false);
    let rule = settings::promotion_rule(conn)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut outcomes = Vec::new();
    let mut promoted = 0usize;
    for student in results::load_roster(&tx, &from.id, false)? {
        let cumulative = results::cumulative_for_student(&tx, &student.id, &academic_session)?;
        let average = results::cumulative_average(&cumulative);
        let verdict = rule.decide(average);
        if verdict == PromotionVerdict::Promoted {
            promoted += 1;
            if !dry_run {
                tx.execute(
                    "UPDATE students SET class_id = ?, branch_id = ?, updated_at = ? WHERE id = ?",
                    (&to.id, &to.branch_id, db::now_ts(), &student.id),
                )
                .map_err(|e| HandlerErr::db("db_update_failed", "students", e))?;
            }
        }
        outcomes.push(json!({
            "studentId": student.id,
            "sowaId": student.sowa_id,
            "name": student.display_name(),
            "cumulativeAverage": average,
            "verdict": verdict,
            "label": verdict.label(),
        }));
    }
    if dry_run {
        tx.rollback()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    } else {
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    }
    if !dry_run {
        tracing::info!(from = %from.id, to = %to.id, promoted, "students promoted");
    }
    Ok(json!({
        "dryRun": dry_run,
        "passMark": rule.pass_mark,
        "promoted": promoted,
        "retained": outcomes.len() - promoted,
        "students": outcomes,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "students.list" => students_list(conn, auth, &req.params),
        "students.get" => students_get(conn, auth, &req.params),
        "students.create" => students_create(conn, auth, &req.params),
        "students.update" => students_update(conn, auth, &req.params),
        "students.setActive" => students_set_active(conn, auth, &req.params),
        "students.transfer" => students_transfer(conn, auth, &req.params),
        "students.delete" => students_delete(conn, auth, &req.params),
        "students.resetPassword" => students_reset_password(conn, auth, &req.params),
        "students.bulkUpload" => students_bulk_upload(conn, auth, &req.params),
        "students.promote" => students_promote(conn, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
