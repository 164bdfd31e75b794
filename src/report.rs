//! Report-card and broadsheet models, and their HTML rendering.

use crate::calc::{self, GradingScale, SubjectStats};
use crate::results::{AttendanceCounts, ClassResults, CumulativeSubject, StudentInfo};
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolHeader {
    pub name: String,
    pub motto: String,
    pub address: String,
    pub phone: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub subject_id: String,
    pub subject: String,
    pub ca1: Option<f64>,
    pub ca2: Option<f64>,
    pub exam: Option<f64>,
    pub total: Option<f64>,
    pub grade: Option<String>,
    pub remark: Option<String>,
    pub class_average: Option<f64>,
    pub highest: Option<f64>,
    pub lowest: Option<f64>,
    pub position: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceBlock {
    pub days_opened: i64,
    pub present: i64,
    pub absent: i64,
    pub late: i64,
    pub excused: i64,
}

impl AttendanceBlock {
    pub fn new(days_opened: i64, counts: AttendanceCounts) -> Self {
        Self {
            days_opened,
            present: counts.present,
            absent: counts.absent,
            late: counts.late,
            excused: counts.excused,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Remarks {
    pub teacher_comment: Option<String>,
    pub principal_comment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeBlock {
    pub subjects: Vec<CumulativeSubject>,
    pub average: Option<f64>,
    pub pass_mark: f64,
    pub verdict: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub school: SchoolHeader,
    pub student: StudentInfo,
    pub class_name: String,
    pub branch_name: String,
    pub term: i64,
    pub session: String,
    pub subjects: Vec<SubjectLine>,
    pub total: f64,
    pub average: Option<f64>,
    pub grade: Option<String>,
    pub position: Option<usize>,
    pub class_size: usize,
    pub attendance: AttendanceBlock,
    pub remarks: Remarks,
    pub cumulative: Option<CumulativeBlock>,
}

/// Per-card extras that do not come from the term's score table.
#[derive(Debug, Clone, Default)]
pub struct CardExtras {
    pub attendance: AttendanceBlock,
    pub remarks: Remarks,
    pub cumulative: Option<CumulativeBlock>,
}

/// Subject statistics and positions, computed once per class.
pub struct ClassStats {
    per_subject: Vec<(Option<SubjectStats>, std::collections::HashMap<String, usize>)>,
    overall: std::collections::HashMap<String, usize>,
    ranked: usize,
}

impl ClassStats {
    pub fn compute(results: &ClassResults) -> Self {
        Self {
            per_subject: results
                .subjects
                .iter()
                .map(|s| (results.subject_stats(&s.id), results.subject_positions(&s.id)))
                .collect(),
            overall: results.class_positions(),
            ranked: results.ranked_count(),
        }
    }
}

pub fn build_card(
    results: &ClassResults,
    stats: &ClassStats,
    student_id: &str,
    scale: &GradingScale,
    school: &SchoolHeader,
    extras: CardExtras,
) -> Option<ReportCard> {
    let student = results.students.iter().find(|s| s.id == student_id)?.clone();
    let mut subjects = Vec::with_capacity(results.subjects.len());
    for (subject, (subject_stats, positions)) in results.subjects.iter().zip(&stats.per_subject) {
        let parts = results.parts(student_id, &subject.id).unwrap_or_default();
        let total = parts.total();
        let band = total.and_then(|t| scale.grade_for(t));
        subjects.push(SubjectLine {
            subject_id: subject.id.clone(),
            subject: subject.name.clone(),
            ca1: parts.ca1,
            ca2: parts.ca2,
            exam: parts.exam,
            total,
            grade: band.map(|b| b.grade.clone()),
            remark: band.map(|b| b.remark.clone()),
            class_average: subject_stats.map(|s| s.average),
            highest: subject_stats.map(|s| s.highest),
            lowest: subject_stats.map(|s| s.lowest),
            position: positions.get(student_id).copied(),
        });
    }
    let summary = results.student_summary(student_id);
    Some(ReportCard {
        school: school.clone(),
        student,
        class_name: results.class.name.clone(),
        branch_name: results.class.branch_name.clone(),
        term: results.term,
        session: results.session.clone(),
        subjects,
        total: summary.total,
        average: summary.average,
        grade: summary
            .average
            .and_then(|a| scale.grade_for(a))
            .map(|b| b.grade.clone()),
        position: stats.overall.get(student_id).copied(),
        class_size: stats.ranked,
        attendance: extras.attendance,
        remarks: extras.remarks,
        cumulative: extras.cumulative,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadsheetRow {
    pub student_id: String,
    pub sowa_id: String,
    pub name: String,
    pub totals: Vec<Option<f64>>,
    pub grand_total: f64,
    pub average: Option<f64>,
    pub grade: Option<String>,
    pub position: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Broadsheet {
    pub class_id: String,
    pub class_name: String,
    pub term: i64,
    pub session: String,
    pub subjects: Vec<String>,
    pub subject_averages: Vec<Option<f64>>,
    pub rows: Vec<BroadsheetRow>,
}

/// Rows come back in position order; unranked students last by name.
pub fn build_broadsheet(results: &ClassResults, scale: &GradingScale) -> Broadsheet {
    let positions = results.class_positions();
    let mut rows: Vec<BroadsheetRow> = results
        .students
        .iter()
        .map(|s| {
            let summary = results.student_summary(&s.id);
            BroadsheetRow {
                student_id: s.id.clone(),
                sowa_id: s.sowa_id.clone(),
                name: s.display_name(),
                totals: results
                    .subjects
                    .iter()
                    .map(|sub| results.total(&s.id, &sub.id))
                    .collect(),
                grand_total: summary.total,
                average: summary.average,
                grade: summary
                    .average
                    .and_then(|a| scale.grade_for(a))
                    .map(|b| b.grade.clone()),
                position: positions.get(&s.id).copied(),
            }
        })
        .collect();
    rows.sort_by(|a, b| match (a.position, b.position) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.name.cmp(&b.name)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.name.cmp(&b.name),
    });
    Broadsheet {
        class_id: results.class.id.clone(),
        class_name: results.class.name.clone(),
        term: results.term,
        session: results.session.clone(),
        subjects: results.subjects.iter().map(|s| s.name.clone()).collect(),
        subject_averages: results
            .subjects
            .iter()
            .map(|s| results.subject_stats(&s.id).map(|st| st.average))
            .collect(),
        rows,
    }
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn num(v: Option<f64>) -> String {
    match v {
        None => "-".to_string(),
        Some(x) if x.fract() == 0.0 => format!("{}", x as i64),
        Some(x) => format!("{:.1}", x),
    }
}

fn term_label(term: i64) -> &'static str {
    match term {
        1 => "First Term",
        2 => "Second Term",
        3 => "Third Term",
        _ => "Term",
    }
}

const STYLE: &str = "body{font-family:Georgia,serif;color:#222;margin:0}\
.card{padding:24px 32px;page-break-after:always}\
.card:last-child{page-break-after:auto}\
h1{margin:0;font-size:22px;text-align:center;text-transform:uppercase}\
.motto{text-align:center;font-style:italic;margin:2px 0}\
.contact{text-align:center;font-size:12px;margin-bottom:12px}\
h2{font-size:16px;text-align:center;margin:8px 0 12px}\
table{border-collapse:collapse;width:100%;margin-bottom:12px;font-size:13px}\
th,td{border:1px solid #555;padding:4px 6px;text-align:center}\
td.l,th.l{text-align:left}\
.meta td{border:none;text-align:left;padding:2px 6px}\
.remarks p{margin:4px 0}";

fn write_card(out: &mut String, card: &ReportCard) {
    let e = escape_html;
    let _ = write!(out, "<section class=\"card\">");
    let _ = write!(out, "<h1>{}</h1>", e(&card.school.name));
    if !card.school.motto.is_empty() {
        let _ = write!(out, "<p class=\"motto\">{}</p>", e(&card.school.motto));
    }
    let contact: Vec<&str> = [
        card.school.address.as_str(),
        card.school.phone.as_str(),
        card.school.email.as_str(),
    ]
    .into_iter()
    .filter(|s| !s.is_empty())
    .collect();
    if !contact.is_empty() {
        let _ = write!(out, "<p class=\"contact\">{}</p>", e(&contact.join(" | ")));
    }
    let _ = write!(
        out,
        "<h2>{} Report Sheet, {} Session</h2>",
        term_label(card.term),
        e(&card.session)
    );

    let _ = write!(
        out,
        "<table class=\"meta\"><tr><td><b>Name:</b> {}</td><td><b>SOWA ID:</b> {}</td></tr>\
         <tr><td><b>Class:</b> {}</td><td><b>Branch:</b> {}</td></tr>\
         <tr><td><b>Position:</b> {}</td><td><b>No. in class:</b> {}</td></tr></table>",
        e(&card.student.display_name()),
        e(&card.student.sowa_id),
        e(&card.class_name),
        e(&card.branch_name),
        card.position.map(calc::ordinal).unwrap_or_else(|| "-".into()),
        card.class_size
    );

    out.push_str(
        "<table><thead><tr><th class=\"l\">Subject</th><th>CA1 (20)</th><th>CA2 (20)</th>\
         <th>Exam (60)</th><th>Total (100)</th><th>Grade</th><th>Remark</th>\
         <th>Class Avg</th><th>Highest</th><th>Lowest</th><th>Position</th></tr></thead><tbody>",
    );
    for line in &card.subjects {
        let _ = write!(
            out,
            "<tr><td class=\"l\">{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
             <td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            e(&line.subject),
            num(line.ca1),
            num(line.ca2),
            num(line.exam),
            num(line.total),
            e(line.grade.as_deref().unwrap_or("-")),
            e(line.remark.as_deref().unwrap_or("-")),
            num(line.class_average),
            num(line.highest),
            num(line.lowest),
            line.position.map(calc::ordinal).unwrap_or_else(|| "-".into()),
        );
    }
    let _ = write!(
        out,
        "</tbody></table><table class=\"meta\"><tr><td><b>Total:</b> {}</td>\
         <td><b>Average:</b> {}</td><td><b>Grade:</b> {}</td></tr></table>",
        num(Some(card.total)),
        num(card.average),
        e(card.grade.as_deref().unwrap_or("-"))
    );

    if let Some(cum) = &card.cumulative {
        out.push_str(
            "<table><thead><tr><th class=\"l\">Subject</th><th>1st Term</th><th>2nd Term</th>\
             <th>3rd Term</th><th>Cumulative Avg</th></tr></thead><tbody>",
        );
        for s in &cum.subjects {
            let _ = write!(
                out,
                "<tr><td class=\"l\">{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                e(&s.subject_name),
                num(s.term_totals[0]),
                num(s.term_totals[1]),
                num(s.term_totals[2]),
                num(s.average)
            );
        }
        let _ = write!(
            out,
            "</tbody></table><table class=\"meta\"><tr><td><b>Cumulative average:</b> {}</td>\
             <td><b>Pass mark:</b> {}</td><td><b>Verdict:</b> {}</td></tr></table>",
            num(cum.average),
            num(Some(cum.pass_mark)),
            e(&cum.verdict)
        );
    }

    let a = &card.attendance;
    let _ = write!(
        out,
        "<table class=\"meta\"><tr><td><b>Days opened:</b> {}</td><td><b>Present:</b> {}</td>\
         <td><b>Absent:</b> {}</td><td><b>Late:</b> {}</td><td><b>Excused:</b> {}</td></tr></table>",
        a.days_opened, a.present, a.absent, a.late, a.excused
    );

    let _ = write!(
        out,
        "<div class=\"remarks\"><p><b>Class teacher:</b> {}</p><p><b>Principal:</b> {}</p></div>",
        e(card.remarks.teacher_comment.as_deref().unwrap_or("")),
        e(card.remarks.principal_comment.as_deref().unwrap_or(""))
    );
    out.push_str("</section>");
}

fn page(title: &str, cards: &[ReportCard]) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{}</title><style>{}</style></head><body>",
        escape_html(title),
        STYLE
    );
    for card in cards {
        write_card(&mut out, card);
    }
    out.push_str("</body></html>");
    out
}

pub fn render_card_html(card: &ReportCard) -> String {
    let title = format!(
        "{} - {} {}",
        card.student.display_name(),
        term_label(card.term),
        card.session
    );
    page(&title, std::slice::from_ref(card))
}

pub fn render_class_cards_html(class_name: &str, term: i64, session: &str, cards: &[ReportCard]) -> String {
    let title = format!("{} - {} {}", class_name, term_label(term), session);
    page(&title, cards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::ScoreParts;
    use crate::reconcile::SubjectRef;
    use crate::results::ClassInfo;
    use std::collections::HashMap;

    fn student(id: &str, first: &str, last: &str) -> StudentInfo {
        StudentInfo {
            id: id.into(),
            sowa_id: format!("SOWA/{id}"),
            first_name: first.into(),
            last_name: last.into(),
            gender: None,
            class_id: "c1".into(),
            branch_id: "b1".into(),
            active: true,
        }
    }

    fn fixture() -> ClassResults {
        let mut scores = HashMap::new();
        let mut put = |st: &str, sub: &str, ca1, ca2, exam| {
            scores.insert(
                (st.to_string(), sub.to_string()),
                ScoreParts { ca1: Some(ca1), ca2: Some(ca2), exam: Some(exam) },
            );
        };
        put("s1", "math", 15.0, 15.0, 50.0);
        put("s2", "math", 10.0, 10.0, 40.0);
        put("s3", "math", 15.0, 15.0, 50.0);
        put("s1", "eng", 10.0, 10.0, 30.0);
        put("s2", "eng", 20.0, 20.0, 55.0);
        ClassResults {
            class: ClassInfo {
                id: "c1".into(),
                name: "JSS 1A".into(),
                level: 1,
                branch_id: "b1".into(),
                branch_name: "Ikeja".into(),
            },
            term: 1,
            session: "2024/2025".into(),
            subjects: vec![
                SubjectRef { id: "math".into(), name: "Mathematics".into() },
                SubjectRef { id: "eng".into(), name: "English <Lang>".into() },
            ],
            students: vec![student("s1", "Ada", "Obi"), student("s2", "Bola", "Ade"), student("s3", "Chi", "Eze"), student("s4", "Dayo", "Ola")],
            scores,
        }
    }

    #[test]
    fn card_carries_stats_positions_and_grades() {
        let results = fixture();
        let stats = ClassStats::compute(&results);
        let card = build_card(
            &results,
            &stats,
            "s1",
            &GradingScale::default(),
            &SchoolHeader { name: "Sowa Schools".into(), ..Default::default() },
            CardExtras::default(),
        )
        .expect("card");
        let math = &card.subjects[0];
        assert_eq!(math.total, Some(80.0));
        assert_eq!(math.grade.as_deref(), Some("A"));
        assert_eq!(math.position, Some(1));
        assert_eq!(math.highest, Some(80.0));
        assert_eq!(math.lowest, Some(60.0));
        let eng = &card.subjects[1];
        assert_eq!(eng.position, Some(2));
        assert_eq!(eng.grade.as_deref(), Some("C"));
        assert_eq!(card.total, 130.0);
        assert_eq!(card.average, Some(65.0));
        // s2 averages 77.5, s3 80, s1 65; s4 has nothing and is unranked.
        assert_eq!(card.position, Some(3));
        assert_eq!(card.class_size, 3);
    }

    #[test]
    fn unknown_student_has_no_card() {
        let results = fixture();
        let stats = ClassStats::compute(&results);
        assert!(build_card(&results, &stats, "nobody", &GradingScale::default(), &SchoolHeader::default(), CardExtras::default()).is_none());
    }

    #[test]
    fn broadsheet_orders_by_position() {
        let sheet = build_broadsheet(&fixture(), &GradingScale::default());
        let order: Vec<&str> = sheet.rows.iter().map(|r| r.student_id.as_str()).collect();
        assert_eq!(order, vec!["s3", "s2", "s1", "s4"]);
        assert_eq!(sheet.rows[3].position, None);
        assert_eq!(sheet.subject_averages[0], Some(73.3));
    }

    #[test]
    fn html_is_escaped_and_paged() {
        let results = fixture();
        let stats = ClassStats::compute(&results);
        let school = SchoolHeader { name: "A & B <School>".into(), ..Default::default() };
        let cards: Vec<ReportCard> = ["s1", "s2"]
            .iter()
            .filter_map(|id| build_card(&results, &stats, id, &GradingScale::default(), &school, CardExtras::default()))
            .collect();
        let html = render_class_cards_html("JSS 1A", 1, "2024/2025", &cards);
        assert!(html.contains("A &amp; B &lt;School&gt;"));
        assert!(html.contains("English &lt;Lang&gt;"));
        assert_eq!(html.matches("<section class=\"card\">").count(), 2);
        assert!(html.contains("First Term Report Sheet, 2024/2025 Session"));
        assert!(html.contains("3rd"));
    }
}
