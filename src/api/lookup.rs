use super::error::HandlerErr;
use super::guard::ensure_branch;
use crate::auth::Session;
use crate::results::{self, ClassInfo, StudentInfo};
use rusqlite::{Connection, OptionalExtension};

pub fn branch_exists(conn: &Connection, branch_id: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row("SELECT 1 FROM branches WHERE id = ?", [branch_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

/// A class the caller may touch.
pub fn class_for(conn: &Connection, session: &Session, class_id: &str) -> Result<ClassInfo, HandlerErr> {
    let class = results::class_info(conn, class_id)?.ok_or_else(|| HandlerErr::not_found("class"))?;
    ensure_branch(session, &class.branch_id)?;
    Ok(class)
}

pub fn student_for(
    conn: &Connection,
    session: &Session,
    student_id: &str,
) -> Result<StudentInfo, HandlerErr> {
    let student =
        results::student_info(conn, student_id)?.ok_or_else(|| HandlerErr::not_found("student"))?;
    ensure_branch(session, &student.branch_id)?;
    Ok(student)
}

#[derive(Debug, Clone)]
pub struct SubjectRow {
    pub id: String,
    pub class_id: String,
    pub name: String,
}

pub fn subject_for(
    conn: &Connection,
    session: &Session,
    subject_id: &str,
) -> Result<(SubjectRow, ClassInfo), HandlerErr> {
    let subject = conn
        .query_row(
            "SELECT id, class_id, name FROM subjects WHERE id = ?",
            [subject_id],
            |r| {
                Ok(SubjectRow {
                    id: r.get(0)?,
                    class_id: r.get(1)?,
                    name: r.get(2)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("subject"))?;
    let class = class_for(conn, session, &subject.class_id)?;
    Ok((subject, class))
}

#[derive(Debug, Clone)]
pub struct FeeRow {
    pub id: String,
    pub branch_id: String,
    pub class_id: Option<String>,
    pub name: String,
    pub amount: f64,
    pub term: i64,
    pub session: String,
    pub due_date: Option<String>,
}

pub const FEE_COLUMNS: &str = "id, branch_id, class_id, name, amount, term, session, due_date";

pub fn fee_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<FeeRow> {
    Ok(FeeRow {
        id: r.get(0)?,
        branch_id: r.get(1)?,
        class_id: r.get(2)?,
        name: r.get(3)?,
        amount: r.get(4)?,
        term: r.get(5)?,
        session: r.get(6)?,
        due_date: r.get(7)?,
    })
}

pub fn fee_for(conn: &Connection, session: &Session, fee_id: &str) -> Result<FeeRow, HandlerErr> {
    let fee = conn
        .query_row(
            &format!("SELECT {FEE_COLUMNS} FROM fees WHERE id = ?"),
            [fee_id],
            fee_from_row,
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("fee"))?;
    ensure_branch(session, &fee.branch_id)?;
    Ok(fee)
}

impl FeeRow {
    pub fn applies_to(&self, student: &StudentInfo) -> bool {
        self.branch_id == student.branch_id
            && self
                .class_id
                .as_deref()
                .map_or(true, |c| c == student.class_id)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "branchId": self.branch_id,
            "classId": self.class_id,
            "name": self.name,
            "amount": self.amount,
            "term": self.term,
            "session": self.session,
            "dueDate": self.due_date,
        })
    }
}
