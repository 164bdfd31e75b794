//! Turns uploaded workbooks into row-level writes.
//!
//! Planning is pure: it sees the workbook plus the current class roster and
//! stored scores, and produces the writes to perform and the per-row errors.
//! A bad row never stops the rows after it.

use crate::calc::{PartEdit, ScoreField, ScoreParts, ScorePatch};
use crate::workbook::{
    find_header, find_header_where, normalize_name, Cell, ColumnSpec, Sheet, Workbook,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize)]
pub struct SubjectRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub student_id: String,
    pub sowa_id: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub sheet: String,
    /// 1-based, as shown by spreadsheet programs.
    pub row: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetStatus {
    Matched,
    Unmatched,
    DuplicateSubject,
    NoHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetOutcome {
    pub sheet: String,
    pub status: SheetStatus,
    pub subject_id: Option<String>,
    pub subject_name: Option<String>,
    pub rows_updated: usize,
    pub rows_unchanged: usize,
    pub rows_failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreWrite {
    pub student_id: String,
    pub subject_id: String,
    pub parts: ScoreParts,
}

#[derive(Debug, Clone, Default)]
pub struct ScoreUploadPlan {
    pub sheets: Vec<SheetOutcome>,
    pub writes: Vec<ScoreWrite>,
    pub errors: Vec<RowError>,
}

const SCORE_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        key: "sowa",
        aliases: &["SOWA ID", "SOWA", "Student ID", "ID", "Admission No", "Reg No"],
    },
    ColumnSpec {
        key: "name",
        aliases: &["Name", "Student Name", "Full Name", "Student"],
    },
    ColumnSpec {
        key: "ca1",
        aliases: &["CA1", "CA 1", "1st CA", "First CA"],
    },
    ColumnSpec {
        key: "ca2",
        aliases: &["CA2", "CA 2", "2nd CA", "Second CA"],
    },
    ColumnSpec {
        key: "exam",
        aliases: &["Exam", "Examination", "Exam Score"],
    },
];

fn subject_for_sheet<'a>(subjects: &'a [SubjectRef], sheet_name: &str) -> Option<&'a SubjectRef> {
    let key = normalize_name(sheet_name);
    if key.is_empty() {
        return None;
    }
    subjects.iter().find(|s| normalize_name(&s.name) == key)
}

struct RosterIndex<'a> {
    by_sowa: HashMap<String, &'a RosterEntry>,
    by_name: HashMap<String, Vec<&'a RosterEntry>>,
}

impl<'a> RosterIndex<'a> {
    fn new(roster: &'a [RosterEntry]) -> Self {
        let mut by_sowa = HashMap::new();
        let mut by_name: HashMap<String, Vec<&RosterEntry>> = HashMap::new();
        for r in roster {
            by_sowa.insert(normalize_name(&r.sowa_id), r);
            let a = normalize_name(&format!("{}{}", r.first_name, r.last_name));
            let b = normalize_name(&format!("{}{}", r.last_name, r.first_name));
            by_name.entry(a.clone()).or_default().push(r);
            if b != a {
                by_name.entry(b).or_default().push(r);
            }
        }
        Self { by_sowa, by_name }
    }

    fn resolve(&self, sowa: &str, name: &str) -> Result<&'a RosterEntry, String> {
        let sowa_key = normalize_name(sowa);
        if !sowa_key.is_empty() {
            return self
                .by_sowa
                .get(&sowa_key)
                .copied()
                .ok_or_else(|| format!("no student with id {} in this class", sowa.trim()));
        }
        let name_key = normalize_name(name);
        if name_key.is_empty() {
            return Err("row has neither a student id nor a name".to_string());
        }
        match self.by_name.get(&name_key).map(|v| v.as_slice()) {
            Some([one]) => Ok(*one),
            Some([]) | None => Err(format!("no student named {} in this class", name.trim())),
            Some(_) => Err(format!(
                "more than one student named {}; use the student id",
                name.trim()
            )),
        }
    }
}

fn row_is_blank(row: &[Cell]) -> bool {
    row.iter().all(Cell::is_blank)
}

fn patch_from_row(sheet: &Sheet, row: usize, cols: &[(ScoreField, usize)]) -> Result<ScorePatch, String> {
    let mut patch = ScorePatch::default();
    for (field, col) in cols {
        let cell = sheet.cell(row, *col);
        // Blank cells keep whatever is stored.
        let value = cell
            .as_number()
            .map_err(|e| format!("{}: {}", field.key(), e))?;
        if let Some(v) = value {
            field
                .check(v)
                .map_err(|e| e.message)?;
            patch.set_edit(*field, PartEdit::Set(Some(v)));
        }
    }
    Ok(patch)
}

pub fn plan_score_upload(
    workbook: &Workbook,
    subjects: &[SubjectRef],
    roster: &[RosterEntry],
    existing: &HashMap<(String, String), ScoreParts>,
) -> ScoreUploadPlan {
    let index = RosterIndex::new(roster);
    let mut plan = ScoreUploadPlan::default();
    let mut seen_subjects: HashSet<String> = HashSet::new();

    for sheet in &workbook.sheets {
        let mut outcome = SheetOutcome {
            sheet: sheet.name.clone(),
            status: SheetStatus::Unmatched,
            subject_id: None,
            subject_name: None,
            rows_updated: 0,
            rows_unchanged: 0,
            rows_failed: 0,
        };

        let Some(subject) = subject_for_sheet(subjects, &sheet.name) else {
            plan.sheets.push(outcome);
            continue;
        };
        outcome.subject_id = Some(subject.id.clone());
        outcome.subject_name = Some(subject.name.clone());

        let header = find_header_where(sheet, SCORE_COLUMNS, |cols| {
            (cols.contains_key("sowa") || cols.contains_key("name"))
                && ["ca1", "ca2", "exam"].iter().any(|k| cols.contains_key(*k))
        });
        let Some(header) = header else {
            outcome.status = SheetStatus::NoHeader;
            plan.sheets.push(outcome);
            continue;
        };
        if !seen_subjects.insert(subject.id.clone()) {
            outcome.status = SheetStatus::DuplicateSubject;
            plan.sheets.push(outcome);
            continue;
        }
        outcome.status = SheetStatus::Matched;

        let score_cols: Vec<(ScoreField, usize)> = ScoreField::ALL
            .iter()
            .filter_map(|f| header.col(f.key()).map(|c| (*f, c)))
            .collect();
        let mut seen_students: HashSet<String> = HashSet::new();

        for row in (header.row + 1)..sheet.rows.len() {
            if row_is_blank(&sheet.rows[row]) {
                continue;
            }
            let sowa = header
                .col("sowa")
                .map(|c| sheet.cell(row, c).as_text())
                .unwrap_or_default();
            let name = header
                .col("name")
                .map(|c| sheet.cell(row, c).as_text())
                .unwrap_or_default();
            let label = if sowa.is_empty() { name.clone() } else { sowa.clone() };

            let result = index.resolve(&sowa, &name).and_then(|student| {
                if seen_students.contains(&student.student_id) {
                    return Err(format!(
                        "student {} appears more than once in this sheet",
                        student.sowa_id
                    ));
                }
                let patch = patch_from_row(sheet, row, &score_cols)?;
                Ok((student, patch))
            });

            match result {
                Ok((student, patch)) => {
                    let key = (student.student_id.clone(), subject.id.clone());
                    let current = existing.get(&key).copied().unwrap_or_default();
                    let next = match patch.apply(current) {
                        Ok(p) => p,
                        Err(e) => {
                            outcome.rows_failed += 1;
                            plan.errors.push(RowError {
                                sheet: sheet.name.clone(),
                                row: row + 1,
                                student: Some(student.sowa_id.clone()),
                                message: e.message,
                            });
                            continue;
                        }
                    };
                    seen_students.insert(student.student_id.clone());
                    if next == current {
                        outcome.rows_unchanged += 1;
                    } else {
                        outcome.rows_updated += 1;
                        plan.writes.push(ScoreWrite {
                            student_id: student.student_id.clone(),
                            subject_id: subject.id.clone(),
                            parts: next,
                        });
                    }
                }
                Err(message) => {
                    outcome.rows_failed += 1;
                    plan.errors.push(RowError {
                        sheet: sheet.name.clone(),
                        row: row + 1,
                        student: (!label.is_empty()).then_some(label),
                        message,
                    });
                }
            }
        }
        plan.sheets.push(outcome);
    }
    plan
}

/// Template sheets for download: one per subject, roster order, current
/// values filled in so an untouched cell uploads back unchanged.
pub fn score_template(
    subjects: &[SubjectRef],
    roster: &[RosterEntry],
    existing: &HashMap<(String, String), ScoreParts>,
) -> Workbook {
    let num = |v: Option<f64>| v.map(Cell::Number).unwrap_or(Cell::Empty);
    let sheets = subjects
        .iter()
        .map(|subject| {
            let mut rows = vec![vec![
                Cell::text("SOWA ID"),
                Cell::text("Name"),
                Cell::text("CA1"),
                Cell::text("CA2"),
                Cell::text("Exam"),
            ]];
            for r in roster {
                let parts = existing
                    .get(&(r.student_id.clone(), subject.id.clone()))
                    .copied()
                    .unwrap_or_default();
                rows.push(vec![
                    Cell::text(r.sowa_id.clone()),
                    Cell::text(format!("{} {}", r.last_name, r.first_name)),
                    num(parts.ca1),
                    num(parts.ca2),
                    num(parts.exam),
                ]);
            }
            Sheet {
                name: subject.name.clone(),
                rows,
            }
        })
        .collect();
    Workbook { sheets }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewStudent {
    pub first_name: String,
    pub last_name: String,
    pub gender: Option<String>,
    pub date_of_birth: Option<String>,
    pub email: Option<String>,
    pub guardian_name: Option<String>,
    pub guardian_phone: Option<String>,
    pub address: Option<String>,
}

const STUDENT_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        key: "first",
        aliases: &["First Name", "Firstname", "Given Name", "Other Names"],
    },
    ColumnSpec {
        key: "last",
        aliases: &["Last Name", "Lastname", "Surname", "Family Name"],
    },
    ColumnSpec {
        key: "gender",
        aliases: &["Gender", "Sex"],
    },
    ColumnSpec {
        key: "dob",
        aliases: &["Date of Birth", "DOB", "Birth Date", "Birthday"],
    },
    ColumnSpec {
        key: "email",
        aliases: &["Email", "E-mail", "Email Address"],
    },
    ColumnSpec {
        key: "guardian",
        aliases: &["Guardian", "Guardian Name", "Parent", "Parent Name"],
    },
    ColumnSpec {
        key: "phone",
        aliases: &["Phone", "Guardian Phone", "Parent Phone", "Phone Number"],
    },
    ColumnSpec {
        key: "address",
        aliases: &["Address", "Home Address"],
    },
];

#[derive(Debug, Clone, Default)]
pub struct StudentUploadPlan {
    pub header_found: bool,
    pub rows: Vec<(usize, NewStudent)>,
    pub errors: Vec<RowError>,
}

pub fn plan_student_upload(sheet: &Sheet) -> StudentUploadPlan {
    let mut plan = StudentUploadPlan::default();
    let Some(header) = find_header(sheet, STUDENT_COLUMNS, &["first", "last"]) else {
        return plan;
    };
    plan.header_found = true;

    let text_at = |row: usize, key: &str| -> Option<String> {
        header
            .col(key)
            .map(|c| sheet.cell(row, c).as_text())
            .filter(|s| !s.is_empty())
    };

    for row in (header.row + 1)..sheet.rows.len() {
        if row_is_blank(&sheet.rows[row]) {
            continue;
        }
        let parsed = (|| -> Result<NewStudent, String> {
            let first_name = text_at(row, "first").ok_or("first name is empty")?;
            let last_name = text_at(row, "last").ok_or("last name is empty")?;
            let gender = match text_at(row, "gender") {
                Some(g) => Some(normalize_gender(&g)?),
                None => None,
            };
            let date_of_birth = match header.col("dob") {
                Some(c) => sheet
                    .cell(row, c)
                    .as_date()?
                    .map(|d| d.format("%Y-%m-%d").to_string()),
                None => None,
            };
            let email = text_at(row, "email");
            if let Some(e) = &email {
                if !looks_like_email(e) {
                    return Err(format!("'{}' is not an email address", e));
                }
            }
            Ok(NewStudent {
                first_name,
                last_name,
                gender,
                date_of_birth,
                email,
                guardian_name: text_at(row, "guardian"),
                guardian_phone: text_at(row, "phone"),
                address: text_at(row, "address"),
            })
        })();
        match parsed {
            Ok(s) => plan.rows.push((row + 1, s)),
            Err(message) => plan.errors.push(RowError {
                sheet: sheet.name.clone(),
                row: row + 1,
                student: None,
                message,
            }),
        }
    }
    plan
}

pub fn normalize_gender(raw: &str) -> Result<String, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "m" | "male" | "boy" => Ok("male".to_string()),
        "f" | "female" | "girl" => Ok("female".to_string()),
        other => Err(format!("gender must be male or female, got '{}'", other)),
    }
}

pub fn looks_like_email(s: &str) -> bool {
    let t = s.trim();
    let Some((local, domain)) = t.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain
            .split_once('.')
            .map(|(a, b)| !a.is_empty() && !b.is_empty())
            .unwrap_or(false)
        && !t.contains(char::is_whitespace)
}
