use crate::api::error::{reply, HandlerErr};
use crate::api::guard::Auth;
use crate::api::lookup::{class_for, student_for};
use crate::api::params::{patch_str, req_session, req_str, req_term};
use crate::api::types::{AppState, Request};
use crate::report::{self, AttendanceBlock, CardExtras, ClassStats, CumulativeBlock, Remarks, ReportCard};
use crate::results::{self, ClassResults, StudentInfo};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

use super::settings;

fn load_remarks(conn: &Connection, student_id: &str, term: i64, session: &str) -> Result<Remarks, HandlerErr> {
    let remarks = conn
        .query_row(
            "SELECT teacher_comment, principal_comment FROM report_remarks
             WHERE student_id = ? AND term = ? AND session = ?",
            (student_id, term, session),
            |r| {
                Ok(Remarks {
                    teacher_comment: r.get(0)?,
                    principal_comment: r.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(remarks.unwrap_or_default())
}

/// Report cards for a class. `only` narrows the output to one student while
/// positions are still computed against the whole class.
pub fn class_cards(
    conn: &Connection,
    class_id: &str,
    term: i64,
    session: &str,
    only: Option<&str>,
) -> Result<Vec<ReportCard>, HandlerErr> {
    let results = ClassResults::load(conn, class_id, term, session)?;
    let stats = ClassStats::compute(&results);
    let scale = settings::grading_scale(conn)?;
    let school = settings::school_header(conn)?;
    let rule = settings::promotion_rule(conn)?;
    let (days_opened, attendance) = results::attendance_summary(conn, class_id, term, session)?;

    let mut cards = Vec::new();
    for student in &results.students {
        if only.is_some_and(|id| id != student.id) {
            continue;
        }
        let cumulative = if term == 3 {
            let subjects = results::cumulative_for_student(conn, &student.id, session)?;
            let average = results::cumulative_average(&subjects);
            Some(CumulativeBlock {
                subjects,
                average,
                pass_mark: rule.pass_mark,
                verdict: rule.decide(average).label().to_string(),
            })
        } else {
            None
        };
        let extras = CardExtras {
            attendance: AttendanceBlock::new(
                days_opened,
                attendance.get(&student.id).copied().unwrap_or_default(),
            ),
            remarks: load_remarks(conn, &student.id, term, session)?,
            cumulative,
        };
        if let Some(card) = report::build_card(&results, &stats, &student.id, &scale, &school, extras) {
            cards.push(card);
        }
    }
    Ok(cards)
}

/// The card of one student, built in the class they sat the term in.
pub fn student_card(
    conn: &Connection,
    student: &StudentInfo,
    term: i64,
    session: &str,
) -> Result<ReportCard, HandlerErr> {
    let class_id = results::term_class_id(conn, student, term, session)?;
    let mut cards = class_cards(conn, &class_id, term, session, Some(&student.id))?;
    cards.pop().ok_or_else(|| HandlerErr::not_found("report card"))
}

fn reports_broadsheet(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class = class_for(conn, session, &req_str(params, "classId")?)?;
    let term = req_term(params)?;
    let academic_session = req_session(params)?;
    let results = ClassResults::load(conn, &class.id, term, &academic_session)?;
    let scale = settings::grading_scale(conn)?;
    let sheet = report::build_broadsheet(&results, &scale);
    serde_json::to_value(sheet).map_err(|e| HandlerErr::new("io_failed", e.to_string()))
}

fn reports_card(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let student = student_for(conn, session, &req_str(params, "studentId")?)?;
    let term = req_term(params)?;
    let academic_session = req_session(params)?;
    let card = student_card(conn, &student, term, &academic_session)?;
    serde_json::to_value(card).map_err(|e| HandlerErr::new("io_failed", e.to_string()))
}

fn reports_card_html(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let student = student_for(conn, session, &req_str(params, "studentId")?)?;
    let term = req_term(params)?;
    let academic_session = req_session(params)?;
    let card = student_card(conn, &student, term, &academic_session)?;
    Ok(json!({ "html": report::render_card_html(&card) }))
}

fn reports_class_cards_html(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let class = class_for(conn, session, &req_str(params, "classId")?)?;
    let term = req_term(params)?;
    let academic_session = req_session(params)?;
    let cards = class_cards(conn, &class.id, term, &academic_session, None)?;
    Ok(json!({
        "cardCount": cards.len(),
        "html": report::render_class_cards_html(&class.name, term, &academic_session, &cards),
    }))
}

fn reports_remarks_set(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    let session = auth.staff()?;
    let student = student_for(conn, session, &req_str(params, "studentId")?)?;
    let term = req_term(params)?;
    let academic_session = req_session(params)?;

    let mut remarks = load_remarks(conn, &student.id, term, &academic_session)?;
    if let Some(v) = patch_str(params, "teacherComment")? {
        remarks.teacher_comment = v;
    }
    if let Some(v) = patch_str(params, "principalComment")? {
        remarks.principal_comment = v;
    }
    conn.execute(
        "INSERT INTO report_remarks(student_id, term, session, teacher_comment, principal_comment)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id, term, session) DO UPDATE SET
           teacher_comment = excluded.teacher_comment,
           principal_comment = excluded.principal_comment",
        (
            &student.id,
            term,
            &academic_session,
            &remarks.teacher_comment,
            &remarks.principal_comment,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", "report_remarks", e))?;
    Ok(json!({
        "studentId": student.id,
        "term": term,
        "session": academic_session,
        "teacherComment": remarks.teacher_comment,
        "principalComment": remarks.principal_comment,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "reports.broadsheet" => reports_broadsheet(conn, auth, &req.params),
        "reports.card" => reports_card(conn, auth, &req.params),
        "reports.cardHtml" => reports_card_html(conn, auth, &req.params),
        "reports.classCardsHtml" => reports_class_cards_html(conn, auth, &req.params),
        "reports.remarks.set" => reports_remarks_set(conn, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}
