//! Fees, payments and the balances derived from them.
//!
//! A fee belongs to a branch and optionally to one class of that branch; a
//! fee without a class applies to every student of the branch. Balances are
//! never stored, they are recomputed from the payments table on every read.

use crate::api::error::{reply, HandlerErr};
use crate::api::guard::{ensure_branch, scope_branch, Auth};
use crate::api::lookup::{branch_exists, class_for, fee_for, fee_from_row, student_for, FeeRow, FEE_COLUMNS};
use crate::api::params::{
    check_session, check_term, opt_f64, opt_i64, opt_str, parse_date, patch_str, req_f64, req_session,
    req_str, req_term,
};
use crate::api::types::{AppState, Request};
use crate::db;
use crate::results::{self, StudentInfo};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

const PAYMENT_METHODS: [&str; 4] = ["cash", "transfer", "card", "cheque"];

/// Currency amounts are kept to two decimals.
pub fn money(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn positive_amount(amount: f64) -> Result<f64, HandlerErr> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(HandlerErr::bad_params("amount must be greater than zero"));
    }
    Ok(money(amount))
}

fn opt_term(params: &Value) -> Result<Option<i64>, HandlerErr> {
    opt_i64(params, "term")?.map(check_term).transpose()
}

fn opt_session(params: &Value) -> Result<Option<String>, HandlerErr> {
    opt_str(params, "session").map(|s| check_session(&s)).transpose()
}

fn paid_towards(conn: &Connection, student_id: &str, fee_id: &str) -> Result<f64, HandlerErr> {
    let paid: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM payments WHERE student_id = ? AND fee_id = ?",
        (student_id, fee_id),
        |r| r.get(0),
    )?;
    Ok(money(paid))
}

/// Fees that apply to the student, optionally narrowed to a term/session.
pub fn applicable_fees(
    conn: &Connection,
    student: &StudentInfo,
    term: Option<i64>,
    session: Option<&str>,
) -> Result<Vec<FeeRow>, HandlerErr> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FEE_COLUMNS} FROM fees
         WHERE branch_id = ?1
           AND (class_id IS NULL OR class_id = ?2)
           AND (?3 IS NULL OR term = ?3)
           AND (?4 IS NULL OR session = ?4)
         ORDER BY session DESC, term DESC, name COLLATE NOCASE"
    ))?;
    let fees = stmt
        .query_map((&student.branch_id, &student.class_id, term, session), fee_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(fees)
}

/// Per-fee expected/paid/balance lines for one student, plus their payments.
pub fn student_statement(
    conn: &Connection,
    student: &StudentInfo,
    term: Option<i64>,
    session: Option<&str>,
) -> Result<Value, HandlerErr> {
    let fees = applicable_fees(conn, student, term, session)?;
    let mut lines = Vec::with_capacity(fees.len());
    let mut expected = 0.0;
    let mut paid = 0.0;
    for fee in &fees {
        let fee_paid = paid_towards(conn, &student.id, &fee.id)?;
        expected += fee.amount;
        paid += fee_paid;
        let mut line = fee.to_json();
        line["paid"] = json!(fee_paid);
        line["balance"] = json!(money(fee.amount - fee_paid));
        lines.push(line);
    }

    let mut stmt = conn.prepare(
        "SELECT p.id, p.fee_id, f.name, p.amount, p.method, p.reference, p.paid_at
         FROM payments p JOIN fees f ON f.id = p.fee_id
         WHERE p.student_id = ?1
           AND (?2 IS NULL OR f.term = ?2)
           AND (?3 IS NULL OR f.session = ?3)
         ORDER BY p.paid_at DESC, p.id",
    )?;
    let payments = stmt
        .query_map((&student.id, term, session), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "feeId": r.get::<_, String>(1)?,
                "feeName": r.get::<_, String>(2)?,
                "amount": r.get::<_, f64>(3)?,
                "method": r.get::<_, String>(4)?,
                "reference": r.get::<_, Option<String>>(5)?,
                "paidAt": r.get::<_, String>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "studentId": student.id,
        "sowaId": student.sowa_id,
        "name": student.display_name(),
        "term": term,
        "session": session,
        "fees": lines,
        "payments": payments,
        "expected": money(expected),
        "paid": money(paid),
        "balance": money(expected - paid),
    }))
}

/// `(expected, collected)` across the fees of a term, optionally one branch.
/// Expected counts every active student a fee applies to.
pub fn fee_totals(
    conn: &Connection,
    branch_id: Option<&str>,
    term: i64,
    session: &str,
) -> Result<(f64, f64), HandlerErr> {
    let expected: f64 = conn.query_row(
        "SELECT COALESCE(SUM(f.amount * (
             SELECT COUNT(*) FROM students s
             WHERE s.active = 1
               AND s.branch_id = f.branch_id
               AND (f.class_id IS NULL OR s.class_id = f.class_id)
           )), 0)
         FROM fees f
         WHERE (?1 IS NULL OR f.branch_id = ?1) AND f.term = ?2 AND f.session = ?3",
        (branch_id, term, session),
        |r| r.get(0),
    )?;
    let collected: f64 = conn.query_row(
        "SELECT COALESCE(SUM(p.amount), 0)
         FROM payments p JOIN fees f ON f.id = p.fee_id
         WHERE (?1 IS NULL OR f.branch_id = ?1) AND f.term = ?2 AND f.session = ?3",
        (branch_id, term, session),
        |r| r.get(0),
    )?;
    Ok((money(expected), money(collected)))
}

fn fees_list(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class_id = opt_str(params, "classId");
    let mut branch = scope_branch(session, opt_str(params, "branchId"))?;
    if let Some(class_id) = &class_id {
        let class = class_for(conn, session, class_id)?;
        branch = Some(class.branch_id);
    }
    let term = opt_term(params)?;
    let academic_session = opt_session(params)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {FEE_COLUMNS},
           (SELECT COALESCE(SUM(p.amount), 0) FROM payments p WHERE p.fee_id = fees.id),
           (SELECT COUNT(*) FROM payments p WHERE p.fee_id = fees.id)
         FROM fees
         WHERE (?1 IS NULL OR branch_id = ?1)
           AND (?2 IS NULL OR class_id IS NULL OR class_id = ?2)
           AND (?3 IS NULL OR term = ?3)
           AND (?4 IS NULL OR session = ?4)
         ORDER BY session DESC, term DESC, name COLLATE NOCASE"
    ))?;
    let fees = stmt
        .query_map((branch, class_id, term, academic_session), |r| {
            let fee = fee_from_row(r)?;
            let mut v = fee.to_json();
            v["collected"] = json!(money(r.get::<_, f64>(8)?));
            v["paymentCount"] = json!(r.get::<_, i64>(9)?);
            Ok(v)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "fees": fees }))
}

fn fees_create(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let branch_id = req_str(params, "branchId")?;
    ensure_branch(session, &branch_id)?;
    if !branch_exists(conn, &branch_id)? {
        return Err(HandlerErr::not_found("branch"));
    }
    let class_id = opt_str(params, "classId");
    if let Some(class_id) = &class_id {
        let class = class_for(conn, session, class_id)?;
        if class.branch_id != branch_id {
            return Err(HandlerErr::bad_params("class does not belong to this branch"));
        }
    }
    let name = req_str(params, "name")?;
    let amount = positive_amount(req_f64(params, "amount")?)?;
    let term = req_term(params)?;
    let academic_session = req_session(params)?;
    let due_date = match opt_str(params, "dueDate") {
        Some(d) => Some(parse_date(&d, "dueDate")?.format("%Y-%m-%d").to_string()),
        None => None,
    };

    let fee = FeeRow {
        id: Uuid::new_v4().to_string(),
        branch_id,
        class_id,
        name,
        amount,
        term,
        session: academic_session,
        due_date,
    };
    conn.execute(
        "INSERT INTO fees(id, branch_id, class_id, name, amount, term, session, due_date, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &fee.id,
            &fee.branch_id,
            &fee.class_id,
            &fee.name,
            fee.amount,
            fee.term,
            &fee.session,
            &fee.due_date,
            db::now_ts(),
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "fees", e))?;
    Ok(fee.to_json())
}

fn fees_update(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let mut fee = fee_for(conn, session, &req_str(params, "feeId")?)?;
    if let Some(name) = opt_str(params, "name") {
        fee.name = name;
    }
    if let Some(amount) = opt_f64(params, "amount")? {
        let amount = positive_amount(amount)?;
        // No student may end up having paid more than the fee.
        let most_paid: f64 = conn.query_row(
            "SELECT COALESCE(MAX(paid), 0) FROM
               (SELECT SUM(amount) AS paid FROM payments WHERE fee_id = ? GROUP BY student_id)",
            [&fee.id],
            |r| r.get(0),
        )?;
        if amount < money(most_paid) {
            return Err(HandlerErr::conflict("amount is below what a student has already paid")
                .with_details(json!({ "amount": amount, "paid": money(most_paid) })));
        }
        fee.amount = amount;
    }
    if let Some(due) = patch_str(params, "dueDate")? {
        fee.due_date = match due {
            Some(d) => Some(parse_date(&d, "dueDate")?.format("%Y-%m-%d").to_string()),
            None => None,
        };
    }
    conn.execute(
        "UPDATE fees SET name = ?, amount = ?, due_date = ? WHERE id = ?",
        (&fee.name, fee.amount, &fee.due_date, &fee.id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "fees", e))?;
    Ok(fee.to_json())
}

fn fees_delete(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let fee = fee_for(conn, session, &req_str(params, "feeId")?)?;
    let payments: i64 = conn.query_row(
        "SELECT COUNT(*) FROM payments WHERE fee_id = ?",
        [&fee.id],
        |r| r.get(0),
    )?;
    if payments > 0 {
        return Err(HandlerErr::conflict("fee has recorded payments")
            .with_details(json!({ "payments": payments })));
    }
    conn.execute("DELETE FROM fees WHERE id = ?", [&fee.id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "fees", e))?;
    Ok(json!({ "ok": true }))
}

fn payment_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "sowaId": r.get::<_, String>(2)?,
        "studentName": format!("{} {}", r.get::<_, String>(3)?, r.get::<_, String>(4)?),
        "feeId": r.get::<_, String>(5)?,
        "feeName": r.get::<_, String>(6)?,
        "amount": r.get::<_, f64>(7)?,
        "method": r.get::<_, String>(8)?,
        "reference": r.get::<_, Option<String>>(9)?,
        "paidAt": r.get::<_, String>(10)?,
        "recordedBy": r.get::<_, Option<String>>(11)?,
    }))
}

const PAYMENT_SELECT: &str = "SELECT
       p.id, p.student_id, s.sowa_id, s.last_name, s.first_name, p.fee_id, f.name,
       p.amount, p.method, p.reference, p.paid_at, u.username
     FROM payments p
     JOIN students s ON s.id = p.student_id
     JOIN fees f ON f.id = p.fee_id
     LEFT JOIN users u ON u.id = p.recorded_by";

fn payments_list(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let student_id = opt_str(params, "studentId");
    let fee_id = opt_str(params, "feeId");
    if let Some(id) = &student_id {
        student_for(conn, session, id)?;
    }
    if let Some(id) = &fee_id {
        fee_for(conn, session, id)?;
    }
    let branch = scope_branch(session, None)?;
    let mut stmt = conn.prepare(&format!(
        "{PAYMENT_SELECT}
         WHERE (?1 IS NULL OR f.branch_id = ?1)
           AND (?2 IS NULL OR p.student_id = ?2)
           AND (?3 IS NULL OR p.fee_id = ?3)
         ORDER BY p.paid_at DESC, p.id"
    ))?;
    let payments = stmt
        .query_map((branch, student_id, fee_id), payment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "payments": payments }))
}

fn payments_record(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let student = student_for(conn, session, &req_str(params, "studentId")?)?;
    let fee = fee_for(conn, session, &req_str(params, "feeId")?)?;
    if !fee.applies_to(&student) {
        return Err(HandlerErr::bad_params("fee does not apply to this student")
            .with_details(json!({ "feeId": fee.id, "studentId": student.id })));
    }
    let amount = positive_amount(req_f64(params, "amount")?)?;
    let method = opt_str(params, "method")
        .unwrap_or_else(|| "cash".to_string())
        .to_ascii_lowercase();
    if !PAYMENT_METHODS.contains(&method.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "method must be one of {}",
            PAYMENT_METHODS.join(", ")
        )));
    }
    let paid_at = match opt_str(params, "paidAt") {
        Some(d) => parse_date(&d, "paidAt")?.format("%Y-%m-%d").to_string(),
        None => chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string(),
    };

    let outstanding = money(fee.amount - paid_towards(conn, &student.id, &fee.id)?);
    if amount > outstanding {
        return Err(HandlerErr::conflict("payment exceeds the outstanding balance")
            .with_details(json!({ "outstanding": outstanding, "amount": amount })));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO payments(id, student_id, fee_id, amount, method, reference, paid_at, recorded_by)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &student.id,
            &fee.id,
            amount,
            &method,
            opt_str(params, "reference"),
            &paid_at,
            &session.user_id,
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", "payments", e))?;
    tracing::info!(student_id = %student.id, fee_id = %fee.id, amount, "payment recorded");
    Ok(json!({
        "id": id,
        "studentId": student.id,
        "feeId": fee.id,
        "amount": amount,
        "method": method,
        "paidAt": paid_at,
        "balance": money(outstanding - amount),
    }))
}

fn payments_delete(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let payment_id = req_str(params, "paymentId")?;
    let branch: String = conn
        .query_row(
            "SELECT f.branch_id FROM payments p JOIN fees f ON f.id = p.fee_id WHERE p.id = ?",
            [&payment_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("payment"))?;
    ensure_branch(session, &branch)?;
    conn.execute("DELETE FROM payments WHERE id = ?", [&payment_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", "payments", e))?;
    Ok(json!({ "ok": true }))
}

fn finance_balances(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class = class_for(conn, session, &req_str(params, "classId")?)?;
    let term = req_term(params)?;
    let academic_session = req_session(params)?;

    // Every fee that applies to one student of the class applies to all of them.
    let expected: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM fees
         WHERE branch_id = ?1 AND (class_id IS NULL OR class_id = ?2) AND term = ?3 AND session = ?4",
        (&class.branch_id, &class.id, term, &academic_session),
        |r| r.get(0),
    )?;
    let mut stmt = conn.prepare(
        "SELECT p.student_id, SUM(p.amount)
         FROM payments p JOIN fees f ON f.id = p.fee_id
         WHERE f.branch_id = ?1 AND (f.class_id IS NULL OR f.class_id = ?2)
           AND f.term = ?3 AND f.session = ?4
         GROUP BY p.student_id",
    )?;
    let paid: HashMap<String, f64> = stmt
        .query_map((&class.branch_id, &class.id, term, &academic_session), |r| {
            Ok((r.get(0)?, r.get(1)?))
        })?
        .collect::<Result<_, _>>()?;

    let expected = money(expected);
    let mut total_paid = 0.0;
    let rows: Vec<Value> = results::load_roster(conn, &class.id, false)?
        .into_iter()
        .map(|s| {
            let p = money(paid.get(&s.id).copied().unwrap_or(0.0));
            total_paid += p;
            json!({
                "studentId": s.id,
                "sowaId": s.sowa_id,
                "name": s.display_name(),
                "expected": expected,
                "paid": p,
                "balance": money(expected - p),
            })
        })
        .collect();
    let total_expected = money(expected * rows.len() as f64);
    Ok(json!({
        "classId": class.id,
        "className": class.name,
        "term": term,
        "session": academic_session,
        "rows": rows,
        "totalExpected": total_expected,
        "totalPaid": money(total_paid),
        "totalBalance": money(total_expected - total_paid),
    }))
}

fn finance_statement(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let student = student_for(conn, session, &req_str(params, "studentId")?)?;
    let term = opt_term(params)?;
    let academic_session = opt_session(params)?;
    student_statement(conn, &student, term, academic_session.as_deref())
}

fn finance_summary(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let branch = scope_branch(session, opt_str(params, "branchId"))?;
    let term = req_term(params)?;
    let academic_session = req_session(params)?;
    let (expected, collected) = fee_totals(conn, branch.as_deref(), term, &academic_session)?;
    Ok(json!({
        "branchId": branch,
        "term": term,
        "session": academic_session,
        "expected": expected,
        "collected": collected,
        "outstanding": money((expected - collected).max(0.0)),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "fees.list" => fees_list(conn, auth, &req.params),
        "fees.create" => fees_create(conn, auth, &req.params),
        "fees.update" => fees_update(conn, auth, &req.params),
        "fees.delete" => fees_delete(conn, auth, &req.params),
        "payments.list" => payments_list(conn, auth, &req.params),
        "payments.record" => payments_record(conn, auth, &req.params),
        "payments.delete" => payments_delete(conn, auth, &req.params),
        "finance.balances" => finance_balances(conn, auth, &req.params),
        "finance.statement" => finance_statement(conn, auth, &req.params),
        "finance.summary" => finance_summary(conn, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
