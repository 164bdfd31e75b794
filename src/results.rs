//! Database-backed views over scores: one class/term/session at a time, or
//! one student across the terms of a session.

use crate::calc::{self, CalcError, ScoreParts, SubjectStats};
use crate::reconcile::{RosterEntry, SubjectRef};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub id: String,
    pub name: String,
    pub level: i64,
    pub branch_id: String,
    pub branch_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentInfo {
    pub id: String,
    pub sowa_id: String,
    pub first_name: String,
    pub last_name: String,
    pub gender: Option<String>,
    pub class_id: String,
    pub branch_id: String,
    pub active: bool,
}

impl StudentInfo {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.last_name, self.first_name)
    }
}

pub fn class_info(conn: &Connection, class_id: &str) -> Result<Option<ClassInfo>, CalcError> {
    conn.query_row(
        "SELECT c.id, c.name, c.level, c.branch_id, b.name
         FROM classes c JOIN branches b ON b.id = c.branch_id
         WHERE c.id = ?",
        [class_id],
        |r| {
            Ok(ClassInfo {
                id: r.get(0)?,
                name: r.get(1)?,
                level: r.get(2)?,
                branch_id: r.get(3)?,
                branch_name: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(db_err)
}

const STUDENT_COLUMNS: &str =
    "id, sowa_id, first_name, last_name, gender, class_id, branch_id, active";

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentInfo> {
    Ok(StudentInfo {
        id: r.get(0)?,
        sowa_id: r.get(1)?,
        first_name: r.get(2)?,
        last_name: r.get(3)?,
        gender: r.get(4)?,
        class_id: r.get(5)?,
        branch_id: r.get(6)?,
        active: r.get::<_, i64>(7)? != 0,
    })
}

pub fn student_info(conn: &Connection, student_id: &str) -> Result<Option<StudentInfo>, CalcError> {
    conn.query_row(
        &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?"),
        [student_id],
        student_from_row,
    )
    .optional()
    .map_err(db_err)
}

/// Students enrolled in a class, ordered by surname then first name.
pub fn load_roster(
    conn: &Connection,
    class_id: &str,
    include_inactive: bool,
) -> Result<Vec<StudentInfo>, CalcError> {
    let sql = format!(
        "SELECT {STUDENT_COLUMNS} FROM students
         WHERE class_id = ? AND (? OR active = 1)
         ORDER BY last_name COLLATE NOCASE, first_name COLLATE NOCASE, sowa_seq"
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    stmt.query_map((class_id, include_inactive), student_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)
}

/// The roster a class had for one term: everyone whose scores for that term
/// were recorded in the class, plus active members who have no scores for the
/// term in another class. Promoted, transferred and withdrawn students keep
/// their place in the classes they sat the term in.
pub fn load_term_roster(
    conn: &Connection,
    class_id: &str,
    term: i64,
    session: &str,
) -> Result<Vec<StudentInfo>, CalcError> {
    let sql = format!(
        "SELECT {STUDENT_COLUMNS} FROM students s
         WHERE s.id IN (SELECT student_id FROM scores WHERE class_id = ?1 AND term = ?2 AND session = ?3)
            OR (s.class_id = ?1 AND s.active = 1 AND NOT EXISTS (
                  SELECT 1 FROM scores o
                  WHERE o.student_id = s.id AND o.term = ?2 AND o.session = ?3 AND o.class_id <> ?1))
         ORDER BY last_name COLLATE NOCASE, first_name COLLATE NOCASE, sowa_seq"
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    stmt.query_map((class_id, term, session), student_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)
}

/// The class a student's results for a term belong to: where their scores
/// were recorded, else their current class.
pub fn term_class_id(
    conn: &Connection,
    student: &StudentInfo,
    term: i64,
    session: &str,
) -> Result<String, CalcError> {
    let recorded: Option<String> = conn
        .query_row(
            "SELECT class_id FROM scores
             WHERE student_id = ? AND term = ? AND session = ?
             GROUP BY class_id
             ORDER BY COUNT(*) DESC, MAX(updated_at) DESC
             LIMIT 1",
            (&student.id, term, session),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    Ok(recorded.unwrap_or_else(|| student.class_id.clone()))
}

pub fn load_subjects(conn: &Connection, class_id: &str) -> Result<Vec<SubjectRef>, CalcError> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM subjects WHERE class_id = ? ORDER BY sort_order, name")
        .map_err(db_err)?;
    stmt.query_map([class_id], |r| {
        Ok(SubjectRef {
            id: r.get(0)?,
            name: r.get(1)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

pub fn load_scores(
    conn: &Connection,
    class_id: &str,
    term: i64,
    session: &str,
) -> Result<HashMap<(String, String), ScoreParts>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, subject_id, ca1, ca2, exam
             FROM scores
             WHERE class_id = ? AND term = ? AND session = ?",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map((class_id, term, session), |r| {
            Ok((
                (r.get::<_, String>(0)?, r.get::<_, String>(1)?),
                ScoreParts {
                    ca1: r.get(2)?,
                    ca2: r.get(3)?,
                    exam: r.get(4)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(rows.into_iter().collect())
}

pub fn is_published(
    conn: &Connection,
    class_id: &str,
    term: i64,
    session: &str,
) -> Result<bool, CalcError> {
    let v: Option<i64> = conn
        .query_row(
            "SELECT published FROM score_publications WHERE class_id = ? AND term = ? AND session = ?",
            (class_id, term, session),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    Ok(v.unwrap_or(0) != 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentTermSummary {
    pub total: f64,
    pub subjects_taken: usize,
    pub average: Option<f64>,
}

/// Everything needed to grade and rank one class for one term.
#[derive(Debug, Clone)]
pub struct ClassResults {
    pub class: ClassInfo,
    pub term: i64,
    pub session: String,
    pub subjects: Vec<SubjectRef>,
    pub students: Vec<StudentInfo>,
    pub scores: HashMap<(String, String), ScoreParts>,
}

impl ClassResults {
    pub fn load(
        conn: &Connection,
        class_id: &str,
        term: i64,
        session: &str,
    ) -> Result<Self, CalcError> {
        let class = class_info(conn, class_id)?
            .ok_or_else(|| CalcError::new("not_found", "class not found"))?;
        Ok(Self {
            class,
            term,
            session: session.to_string(),
            subjects: load_subjects(conn, class_id)?,
            students: load_term_roster(conn, class_id, term, session)?,
            scores: load_scores(conn, class_id, term, session)?,
        })
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.students
            .iter()
            .map(|s| RosterEntry {
                student_id: s.id.clone(),
                sowa_id: s.sowa_id.clone(),
                first_name: s.first_name.clone(),
                last_name: s.last_name.clone(),
            })
            .collect()
    }

    pub fn parts(&self, student_id: &str, subject_id: &str) -> Option<ScoreParts> {
        self.scores
            .get(&(student_id.to_string(), subject_id.to_string()))
            .copied()
    }

    pub fn total(&self, student_id: &str, subject_id: &str) -> Option<f64> {
        self.parts(student_id, subject_id).and_then(|p| p.total())
    }

    fn subject_totals(&self, subject_id: &str) -> Vec<(String, f64)> {
        self.students
            .iter()
            .filter_map(|s| self.total(&s.id, subject_id).map(|t| (s.id.clone(), t)))
            .collect()
    }

    pub fn subject_stats(&self, subject_id: &str) -> Option<SubjectStats> {
        calc::subject_stats(self.subject_totals(subject_id).into_iter().map(|(_, t)| t))
    }

    pub fn subject_positions(&self, subject_id: &str) -> HashMap<String, usize> {
        calc::rank_desc(&self.subject_totals(subject_id))
    }

    pub fn student_summary(&self, student_id: &str) -> StudentTermSummary {
        let totals: Vec<f64> = self
            .subjects
            .iter()
            .filter_map(|sub| self.total(student_id, &sub.id))
            .collect();
        let total: f64 = totals.iter().sum();
        StudentTermSummary {
            total: calc::round_off_1_decimal(total),
            subjects_taken: totals.len(),
            average: (!totals.is_empty())
                .then(|| calc::round_off_1_decimal(total / totals.len() as f64)),
        }
    }

    /// Overall class position by term average. Students without any score
    /// are not ranked.
    pub fn class_positions(&self) -> HashMap<String, usize> {
        let averages: Vec<(String, f64)> = self
            .students
            .iter()
            .filter_map(|s| self.student_summary(&s.id).average.map(|a| (s.id.clone(), a)))
            .collect();
        calc::rank_desc(&averages)
    }

    pub fn ranked_count(&self) -> usize {
        self.students
            .iter()
            .filter(|s| self.student_summary(&s.id).average.is_some())
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeSubject {
    pub subject_name: String,
    pub term_totals: [Option<f64>; 3],
    pub average: Option<f64>,
}

/// Per-subject totals of one student over the three terms of a session,
/// merged by subject name so a mid-session class change keeps its history.
pub fn cumulative_for_student(
    conn: &Connection,
    student_id: &str,
    session: &str,
) -> Result<Vec<CumulativeSubject>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT sub.name, sc.term, sc.ca1, sc.ca2, sc.exam
             FROM scores sc
             JOIN subjects sub ON sub.id = sc.subject_id
             WHERE sc.student_id = ? AND sc.session = ?
             ORDER BY sub.sort_order, sub.name",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map((student_id, session), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                ScoreParts {
                    ca1: r.get(2)?,
                    ca2: r.get(3)?,
                    exam: r.get(4)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut order: Vec<String> = Vec::new();
    let mut by_name: BTreeMap<String, CumulativeSubject> = BTreeMap::new();
    for (name, term, parts) in rows {
        let key = name.trim().to_lowercase();
        let entry = by_name.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            CumulativeSubject {
                subject_name: name.clone(),
                term_totals: [None; 3],
                average: None,
            }
        });
        if (1..=3).contains(&term) {
            entry.term_totals[(term - 1) as usize] = parts.total();
        }
    }

    let mut out = Vec::with_capacity(order.len());
    for key in order {
        if let Some(mut subject) = by_name.remove(&key) {
            subject.average = calc::mean_present(&subject.term_totals).map(calc::round_off_1_decimal);
            if subject.average.is_some() {
                out.push(subject);
            }
        }
    }
    Ok(out)
}

/// Mean of subject cumulative averages.
pub fn cumulative_average(subjects: &[CumulativeSubject]) -> Option<f64> {
    let avgs: Vec<Option<f64>> = subjects.iter().map(|s| s.average).collect();
    calc::mean_present(&avgs).map(calc::round_off_1_decimal)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceCounts {
    pub present: i64,
    pub absent: i64,
    pub late: i64,
    pub excused: i64,
}

impl AttendanceCounts {
    pub fn attended(&self) -> i64 {
        self.present + self.late
    }
}

pub fn attendance_summary(
    conn: &Connection,
    class_id: &str,
    term: i64,
    session: &str,
) -> Result<(i64, HashMap<String, AttendanceCounts>), CalcError> {
    let days_opened: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT date) FROM attendance_records
             WHERE class_id = ? AND term = ? AND session = ?",
            (class_id, term, session),
            |r| r.get(0),
        )
        .map_err(db_err)?;

    let mut stmt = conn
        .prepare(
            "SELECT student_id, status, COUNT(*)
             FROM attendance_records
             WHERE class_id = ? AND term = ? AND session = ?
             GROUP BY student_id, status",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map((class_id, term, session), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut out: HashMap<String, AttendanceCounts> = HashMap::new();
    for (student_id, status, n) in rows {
        let c = out.entry(student_id).or_default();
        match status.as_str() {
            "present" => c.present += n,
            "absent" => c.absent += n,
            "late" => c.late += n,
            "excused" => c.excused += n,
            _ => {}
        }
    }
    Ok((days_opened, out))
}
