use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;

pub const CA_MAX: f64 = 20.0;
pub const EXAM_MAX: f64 = 60.0;

/// 1-decimal rounding used for every displayed total and average:
/// `floor(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoreField {
    Ca1,
    Ca2,
    Exam,
}

impl ScoreField {
    pub const ALL: [ScoreField; 3] = [ScoreField::Ca1, ScoreField::Ca2, ScoreField::Exam];

    pub fn key(self) -> &'static str {
        match self {
            ScoreField::Ca1 => "ca1",
            ScoreField::Ca2 => "ca2",
            ScoreField::Exam => "exam",
        }
    }

    pub fn max(self) -> f64 {
        match self {
            ScoreField::Ca1 | ScoreField::Ca2 => CA_MAX,
            ScoreField::Exam => EXAM_MAX,
        }
    }

    pub fn check(self, value: f64) -> Result<f64, CalcError> {
        if !value.is_finite() || value < 0.0 || value > self.max() {
            return Err(CalcError::new(
                "bad_params",
                format!("{} must be between 0 and {}", self.key(), self.max()),
            )
            .with_details(serde_json::json!({ "field": self.key(), "value": value })));
        }
        Ok(value)
    }
}

/// The three stored components of one subject score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreParts {
    pub ca1: Option<f64>,
    pub ca2: Option<f64>,
    pub exam: Option<f64>,
}

impl ScoreParts {
    pub fn get(&self, field: ScoreField) -> Option<f64> {
        match field {
            ScoreField::Ca1 => self.ca1,
            ScoreField::Ca2 => self.ca2,
            ScoreField::Exam => self.exam,
        }
    }

    pub fn set(&mut self, field: ScoreField, value: Option<f64>) {
        match field {
            ScoreField::Ca1 => self.ca1 = value,
            ScoreField::Ca2 => self.ca2 = value,
            ScoreField::Exam => self.exam = value,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ca1.is_none() && self.ca2.is_none() && self.exam.is_none()
    }

    /// Sum of present parts; `None` when nothing has been entered.
    pub fn total(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        Some(self.ca1.unwrap_or(0.0) + self.ca2.unwrap_or(0.0) + self.exam.unwrap_or(0.0))
    }

    pub fn validate(&self) -> Result<(), CalcError> {
        for field in ScoreField::ALL {
            if let Some(v) = self.get(field) {
                field.check(v)?;
            }
        }
        Ok(())
    }
}

/// Per-field edit: `Keep` leaves the stored value, `Set(None)` clears it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PartEdit {
    #[default]
    Keep,
    Set(Option<f64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScorePatch {
    pub ca1: PartEdit,
    pub ca2: PartEdit,
    pub exam: PartEdit,
}

impl ScorePatch {
    pub fn edit(&self, field: ScoreField) -> PartEdit {
        match field {
            ScoreField::Ca1 => self.ca1,
            ScoreField::Ca2 => self.ca2,
            ScoreField::Exam => self.exam,
        }
    }

    pub fn set_edit(&mut self, field: ScoreField, edit: PartEdit) {
        match field {
            ScoreField::Ca1 => self.ca1 = edit,
            ScoreField::Ca2 => self.ca2 = edit,
            ScoreField::Exam => self.exam = edit,
        }
    }

    pub fn apply(&self, existing: ScoreParts) -> Result<ScoreParts, CalcError> {
        let mut out = existing;
        for field in ScoreField::ALL {
            if let PartEdit::Set(v) = self.edit(field) {
                let checked = match v {
                    Some(x) => Some(field.check(x)?),
                    None => None,
                };
                out.set(field, checked);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBand {
    pub grade: String,
    pub min: f64,
    pub max: f64,
    pub remark: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingScale {
    pub bands: Vec<GradeBand>,
}

impl Default for GradingScale {
    fn default() -> Self {
        let band = |grade: &str, min: f64, max: f64, remark: &str| GradeBand {
            grade: grade.to_string(),
            min,
            max,
            remark: remark.to_string(),
        };
        Self {
            bands: vec![
                band("A", 70.0, 100.0, "Excellent"),
                band("B", 60.0, 69.9, "Very Good"),
                band("C", 50.0, 59.9, "Good"),
                band("D", 45.0, 49.9, "Fair"),
                band("E", 40.0, 44.9, "Poor"),
                band("F", 0.0, 39.9, "Fail"),
            ],
        }
    }
}

impl GradingScale {
    /// Bands must not overlap and must leave no 0.1-wide gap in 0..=100.
    pub fn validate(&self) -> Result<(), CalcError> {
        if self.bands.is_empty() {
            return Err(CalcError::new("bad_params", "grading scale has no bands"));
        }
        let mut sorted: Vec<&GradeBand> = self.bands.iter().collect();
        sorted.sort_by(|a, b| a.min.partial_cmp(&b.min).unwrap_or(Ordering::Equal));
        for b in &sorted {
            if b.grade.trim().is_empty() {
                return Err(CalcError::new("bad_params", "grade label must not be empty"));
            }
            if !(b.min.is_finite() && b.max.is_finite()) || b.min > b.max {
                return Err(CalcError::new("bad_params", "band min must not exceed max")
                    .with_details(serde_json::json!({ "grade": b.grade })));
            }
        }
        if sorted[0].min > 0.0 || sorted[sorted.len() - 1].max < 100.0 {
            return Err(CalcError::new("bad_params", "bands must cover 0 to 100"));
        }
        for pair in sorted.windows(2) {
            let gap = round_off_1_decimal(pair[1].min - pair[0].max);
            if gap <= 0.0 {
                return Err(CalcError::new("bad_params", "grade bands overlap").with_details(
                    serde_json::json!({ "grades": [pair[0].grade, pair[1].grade] }),
                ));
            }
            if gap > 0.1 {
                return Err(CalcError::new("bad_params", "grade bands leave a gap").with_details(
                    serde_json::json!({ "grades": [pair[0].grade, pair[1].grade] }),
                ));
            }
        }
        Ok(())
    }

    pub fn grade_for(&self, total: f64) -> Option<&GradeBand> {
        let t = round_off_1_decimal(total);
        self.bands.iter().find(|b| t >= b.min && t <= b.max)
    }
}

/// Competition ranking, highest value first: equal values share a rank and
/// the following rank is skipped (1, 1, 3).
pub fn rank_desc<K>(values: &[(K, f64)]) -> HashMap<K, usize>
where
    K: Clone + Eq + Hash,
{
    let mut sorted: Vec<&(K, f64)> = values.iter().collect();
    sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    let mut out = HashMap::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    let mut rank = 0usize;
    for (i, (k, v)) in sorted.into_iter().map(|e| (&e.0, e.1)).enumerate() {
        let v = round_off_1_decimal(v);
        if prev != Some(v) {
            rank = i + 1;
            prev = Some(v);
        }
        out.insert(k.clone(), rank);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStats {
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub count: usize,
}

pub fn subject_stats<I>(totals: I) -> Option<SubjectStats>
where
    I: IntoIterator<Item = f64>,
{
    let mut count = 0usize;
    let mut sum = 0.0;
    let mut highest = f64::MIN;
    let mut lowest = f64::MAX;
    for t in totals {
        count += 1;
        sum += t;
        highest = highest.max(t);
        lowest = lowest.min(t);
    }
    if count == 0 {
        return None;
    }
    Some(SubjectStats {
        average: round_off_1_decimal(sum / count as f64),
        highest,
        lowest,
        count,
    })
}

/// Mean of the values that are present; `None` when none are.
pub fn mean_present(values: &[Option<f64>]) -> Option<f64> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        return None;
    }
    Some(present.iter().sum::<f64>() / present.len() as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionVerdict {
    Promoted,
    Repeat,
    NoScores,
}

impl PromotionVerdict {
    pub fn label(self) -> &'static str {
        match self {
            PromotionVerdict::Promoted => "Promoted",
            PromotionVerdict::Repeat => "Not Promoted",
            PromotionVerdict::NoScores => "No Result",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionRule {
    pub pass_mark: f64,
}

impl Default for PromotionRule {
    fn default() -> Self {
        Self { pass_mark: 40.0 }
    }
}

impl PromotionRule {
    pub fn decide(&self, cumulative_average: Option<f64>) -> PromotionVerdict {
        match cumulative_average {
            None => PromotionVerdict::NoScores,
            Some(avg) if round_off_1_decimal(avg) >= self.pass_mark => PromotionVerdict::Promoted,
            Some(_) => PromotionVerdict::Repeat,
        }
    }
}

pub fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_sums_present_parts_only() {
        let p = ScoreParts {
            ca1: Some(15.0),
            ca2: None,
            exam: Some(48.5),
        };
        assert_eq!(p.total(), Some(63.5));
        assert_eq!(ScoreParts::default().total(), None);
    }

    #[test]
    fn caps_are_enforced_per_field() {
        assert!(ScoreField::Ca1.check(20.0).is_ok());
        assert!(ScoreField::Ca2.check(20.5).is_err());
        assert!(ScoreField::Exam.check(60.0).is_ok());
        assert!(ScoreField::Exam.check(61.0).is_err());
        assert!(ScoreField::Exam.check(-1.0).is_err());
        assert!(ScoreField::Ca1.check(f64::NAN).is_err());
    }

    #[test]
    fn patch_keeps_sets_and_clears() {
        let existing = ScoreParts {
            ca1: Some(10.0),
            ca2: Some(12.0),
            exam: Some(40.0),
        };
        let patch = ScorePatch {
            ca1: PartEdit::Keep,
            ca2: PartEdit::Set(None),
            exam: PartEdit::Set(Some(55.0)),
        };
        let out = patch.apply(existing).expect("apply");
        assert_eq!(out.ca1, Some(10.0));
        assert_eq!(out.ca2, None);
        assert_eq!(out.exam, Some(55.0));

        let bad = ScorePatch {
            exam: PartEdit::Set(Some(75.0)),
            ..ScorePatch::default()
        };
        assert!(bad.apply(existing).is_err());
    }

    #[test]
    fn default_scale_grades_boundaries() {
        let scale = GradingScale::default();
        scale.validate().expect("default scale is valid");
        assert_eq!(scale.grade_for(70.0).map(|b| b.grade.as_str()), Some("A"));
        assert_eq!(scale.grade_for(69.95).map(|b| b.grade.as_str()), Some("A"));
        assert_eq!(scale.grade_for(69.9).map(|b| b.grade.as_str()), Some("B"));
        assert_eq!(scale.grade_for(45.0).map(|b| b.grade.as_str()), Some("D"));
        assert_eq!(scale.grade_for(39.9).map(|b| b.grade.as_str()), Some("F"));
        assert_eq!(scale.grade_for(0.0).map(|b| b.remark.as_str()), Some("Fail"));
    }

    #[test]
    fn scale_validation_rejects_overlap_and_gap() {
        let mut overlap = GradingScale::default();
        overlap.bands[1].max = 72.0;
        assert!(overlap.validate().is_err());

        let mut gap = GradingScale::default();
        gap.bands[2].max = 55.0;
        assert!(gap.validate().is_err());

        let mut short = GradingScale::default();
        short.bands[0].max = 90.0;
        assert!(short.validate().is_err());
    }

    #[test]
    fn ranking_shares_ties_and_skips() {
        let values = vec![("a", 80.0), ("b", 92.0), ("c", 80.0), ("d", 55.0)];
        let ranks = rank_desc(&values);
        assert_eq!(ranks["b"], 1);
        assert_eq!(ranks["a"], 2);
        assert_eq!(ranks["c"], 2);
        assert_eq!(ranks["d"], 4);
    }

    #[test]
    fn stats_over_totals() {
        let s = subject_stats(vec![50.0, 75.0, 62.0]).expect("stats");
        assert_eq!(s.highest, 75.0);
        assert_eq!(s.lowest, 50.0);
        assert_eq!(s.average, 62.3);
        assert_eq!(s.count, 3);
        assert!(subject_stats(Vec::<f64>::new()).is_none());
    }

    #[test]
    fn promotion_uses_pass_mark() {
        let rule = PromotionRule { pass_mark: 50.0 };
        assert_eq!(rule.decide(Some(49.96)), PromotionVerdict::Promoted);
        assert_eq!(rule.decide(Some(49.9)), PromotionVerdict::Repeat);
        assert_eq!(rule.decide(None), PromotionVerdict::NoScores);
        assert_eq!(mean_present(&[Some(60.0), None, Some(40.0)]), Some(50.0));
    }

    #[test]
    fn ordinals() {
        assert_eq!(ordinal(1), "1st");
        assert_eq!(ordinal(2), "2nd");
        assert_eq!(ordinal(3), "3rd");
        assert_eq!(ordinal(11), "11th");
        assert_eq!(ordinal(12), "12th");
        assert_eq!(ordinal(22), "22nd");
        assert_eq!(ordinal(104), "104th");
    }
}
