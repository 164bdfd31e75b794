use crate::api::error::{reply, HandlerErr};
use crate::api::guard::Auth;
use crate::api::params::check_session;
use crate::api::types::{AppState, Request};
use crate::calc::{GradeBand, GradingScale, PromotionRule};
use crate::db;
use crate::report::SchoolHeader;
use chrono::Datelike;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Section {
    School,
    Academic,
    Grading,
    Promotion,
    Students,
}

impl Section {
    pub const ALL: [Section; 5] = [
        Section::School,
        Section::Academic,
        Section::Grading,
        Section::Promotion,
        Section::Students,
    ];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "school" => Some(Self::School),
            "academic" => Some(Self::Academic),
            "grading" => Some(Self::Grading),
            "promotion" => Some(Self::Promotion),
            "students" => Some(Self::Students),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::School => "school",
            Self::Academic => "academic",
            Self::Grading => "grading",
            Self::Promotion => "promotion",
            Self::Students => "students",
        }
    }

    fn key(self) -> String {
        format!("settings.{}", self.name())
    }
}

/// The session running on a given date; sessions start in September.
pub fn session_for_date(date: chrono::NaiveDate) -> String {
    let y = date.year();
    if date.month() >= 9 {
        format!("{}/{}", y, y + 1)
    } else {
        format!("{}/{}", y - 1, y)
    }
}

fn default_section(section: Section) -> Value {
    match section {
        Section::School => json!({
            "name": "Sowa Schools",
            "motto": "",
            "address": "",
            "phone": "",
            "email": ""
        }),
        Section::Academic => json!({
            "currentTerm": 1,
            "currentSession": session_for_date(chrono::Utc::now().date_naive())
        }),
        Section::Grading => json!({ "bands": GradingScale::default().bands }),
        Section::Promotion => json!({ "passMark": PromotionRule::default().pass_mark }),
        Section::Students => json!({
            "idPrefix": "SOWA",
            "defaultPassword": "changeme"
        }),
    }
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: Section,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "settings section must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            Section::School => match k.as_str() {
                "name" => {
                    let s = parse_string_max(v, k, 120)?;
                    if s.is_empty() {
                        return Err("name must not be empty".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "motto" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 200)?));
                }
                "address" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 300)?));
                }
                "phone" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 40)?));
                }
                "email" => {
                    let s = parse_string_max(v, k, 200)?;
                    if !s.is_empty() && !crate::reconcile::looks_like_email(&s) {
                        return Err("email is not a valid address".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
            Section::Academic => match k.as_str() {
                "currentTerm" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 3)?));
                }
                "currentSession" => {
                    let raw = parse_string_max(v, k, 9)?;
                    let s = check_session(&raw).map_err(|e| e.message)?;
                    obj.insert(k.clone(), Value::String(s));
                }
                _ => return Err(format!("unknown academic field: {}", k)),
            },
            Section::Grading => match k.as_str() {
                "bands" => {
                    let bands: Vec<GradeBand> = serde_json::from_value(v.clone())
                        .map_err(|e| format!("bands are malformed: {}", e))?;
                    let scale = GradingScale { bands };
                    scale.validate().map_err(|e| e.message)?;
                    obj.insert(k.clone(), json!(scale.bands));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            Section::Promotion => match k.as_str() {
                "passMark" => {
                    let n = v
                        .as_f64()
                        .filter(|n| (0.0..=100.0).contains(n))
                        .ok_or_else(|| "passMark must be a number in 0..=100".to_string())?;
                    obj.insert(k.clone(), json!(n));
                }
                _ => return Err(format!("unknown promotion field: {}", k)),
            },
            Section::Students => match k.as_str() {
                "idPrefix" => {
                    let s = parse_string_max(v, k, 12)?.to_ascii_uppercase();
                    if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric()) {
                        return Err("idPrefix must be letters and digits only".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "defaultPassword" => {
                    let s = parse_string_max(v, k, 128)?;
                    if s.chars().count() < 6 {
                        return Err("defaultPassword must be at least 6 characters".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                _ => return Err(format!("unknown students field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: Section) -> Result<Value, HandlerErr> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, &section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Stored values that no longer validate fall back to defaults.
            let mut merged = current.clone();
            if merge_section_patch(section, &mut merged, saved_obj).is_ok() {
                current = merged;
            }
        }
    }
    Ok(current)
}

fn text(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_default()
        .to_string()
}

pub fn school_header(conn: &Connection) -> Result<SchoolHeader, HandlerErr> {
    let v = load_section(conn, Section::School)?;
    Ok(SchoolHeader {
        name: text(&v, "name"),
        motto: text(&v, "motto"),
        address: text(&v, "address"),
        phone: text(&v, "phone"),
        email: text(&v, "email"),
    })
}

/// Current `(term, session)`.
pub fn academic(conn: &Connection) -> Result<(i64, String), HandlerErr> {
    let v = load_section(conn, Section::Academic)?;
    let term = v.get("currentTerm").and_then(|x| x.as_i64()).unwrap_or(1);
    Ok((term, text(&v, "currentSession")))
}

pub fn grading_scale(conn: &Connection) -> Result<GradingScale, HandlerErr> {
    let v = load_section(conn, Section::Grading)?;
    let bands = v
        .get("bands")
        .cloned()
        .and_then(|b| serde_json::from_value::<Vec<GradeBand>>(b).ok());
    Ok(bands
        .map(|bands| GradingScale { bands })
        .unwrap_or_default())
}

pub fn promotion_rule(conn: &Connection) -> Result<PromotionRule, HandlerErr> {
    let v = load_section(conn, Section::Promotion)?;
    Ok(v.get("passMark")
        .and_then(|x| x.as_f64())
        .map(|pass_mark| PromotionRule { pass_mark })
        .unwrap_or_default())
}

/// `(idPrefix, defaultPassword)` for new student accounts.
pub fn student_defaults(conn: &Connection) -> Result<(String, String), HandlerErr> {
    let v = load_section(conn, Section::Students)?;
    Ok((text(&v, "idPrefix"), text(&v, "defaultPassword")))
}

fn settings_get(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    auth.staff()?;
    match params.get("section").and_then(|v| v.as_str()) {
        Some(raw) => {
            let section = Section::parse(raw)
                .ok_or_else(|| HandlerErr::bad_params("unknown section"))?;
            Ok(json!({ "section": section.name(), "values": load_section(conn, section)? }))
        }
        None => {
            let mut all = Map::new();
            for section in Section::ALL {
                all.insert(section.name().to_string(), load_section(conn, section)?);
            }
            Ok(Value::Object(all))
        }
    }
}

fn settings_update(conn: &Connection, auth: &Auth, params: &Value) -> Result<Value, HandlerErr> {
    auth.admin()?;
    let raw = params
        .get("section")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing section"))?;
    let section = Section::parse(raw).ok_or_else(|| HandlerErr::bad_params("unknown section"))?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;

    let mut current = load_section(conn, section)?;
    merge_section_patch(section, &mut current, patch).map_err(HandlerErr::bad_params)?;
    db::settings_set_json(conn, &section.key(), &current)
        .map_err(|e| HandlerErr::db("db_update_failed", "settings", e))?;
    tracing::info!(section = section.name(), "settings updated");
    Ok(json!({ "section": section.name(), "values": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request, auth: &Auth) -> Option<Value> {
    let conn = &state.db;
    let result = match req.method.as_str() {
        "settings.get" => settings_get(conn, auth, &req.params),
        "settings.update" => settings_update(conn, auth, &req.params),
        _ => return None,
    };
    Some(reply(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_rolls_over_in_september() {
        let d = |y, m, day| chrono::NaiveDate::from_ymd_opt(y, m, day).expect("date");
        assert_eq!(session_for_date(d(2024, 8, 31)), "2023/2024");
        assert_eq!(session_for_date(d(2024, 9, 1)), "2024/2025");
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        let mut cur = default_section(Section::Academic);
        let bad_key = json!({"term": 2});
        assert!(merge_section_patch(Section::Academic, &mut cur, bad_key.as_object().expect("obj")).is_err());
        let bad_session = json!({"currentSession": "2024/2030"});
        assert!(merge_section_patch(Section::Academic, &mut cur, bad_session.as_object().expect("obj")).is_err());
        let good = json!({"currentTerm": 2, "currentSession": "2025/2026"});
        merge_section_patch(Section::Academic, &mut cur, good.as_object().expect("obj")).expect("merge");
        assert_eq!(cur["currentTerm"], 2);
        assert_eq!(cur["currentSession"], "2025/2026");
    }

    #[test]
    fn grading_bands_must_cover_the_range() {
        let mut cur = default_section(Section::Grading);
        let gap = json!({"bands": [
            {"grade": "P", "min": 50.0, "max": 100.0, "remark": "Pass"},
            {"grade": "F", "min": 0.0, "max": 40.0, "remark": "Fail"}
        ]});
        assert!(merge_section_patch(Section::Grading, &mut cur, gap.as_object().expect("obj")).is_err());
    }

    #[test]
    fn stored_values_override_defaults() {
        let conn = db::open_in_memory().expect("db");
        db::settings_set_json(&conn, "settings.students", &json!({"idPrefix": "abc"})).expect("set");
        let (prefix, password) = student_defaults(&conn).expect("defaults");
        assert_eq!(prefix, "ABC");
        assert_eq!(password, "changeme");
    }
}
