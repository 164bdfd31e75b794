use super::error::HandlerErr;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::NaiveDate;
use serde_json::Value;

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

pub fn req_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {key}")))?
        .trim()
        .to_string();
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{key} must not be empty")));
    }
    Ok(s)
}

pub fn opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Patch semantics for nullable text columns: absent leaves the column
/// alone, `null` or `""` clears it.
pub fn patch_str(params: &Value, key: &str) -> Result<Option<Option<String>>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(Some((!t.is_empty()).then(|| t.to_string())))
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{key} must be a string or null"))),
    }
}

pub fn opt_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|x| x.is_finite())
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{key} must be a number"))),
    }
}

pub fn req_f64(params: &Value, key: &str) -> Result<f64, HandlerErr> {
    opt_f64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {key}")))
}

pub fn opt_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{key} must be an integer"))),
    }
}

pub fn opt_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{key} must be a boolean"))),
    }
}

pub fn req_bool(params: &Value, key: &str) -> Result<bool, HandlerErr> {
    opt_bool(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {key}")))
}

pub fn check_term(term: i64) -> Result<i64, HandlerErr> {
    if (1..=3).contains(&term) {
        Ok(term)
    } else {
        Err(HandlerErr::bad_params("term must be 1, 2 or 3"))
    }
}

pub fn req_term(params: &Value) -> Result<i64, HandlerErr> {
    let term = opt_i64(params, "term")?.ok_or_else(|| HandlerErr::bad_params("missing term"))?;
    check_term(term)
}

/// Academic sessions are written `2024/2025`: two consecutive years.
pub fn check_session(s: &str) -> Result<String, HandlerErr> {
    let bad = || HandlerErr::bad_params("session must look like 2024/2025");
    let (a, b) = s.trim().split_once('/').ok_or_else(bad)?;
    if a.len() != 4 || b.len() != 4 {
        return Err(bad());
    }
    let first: i32 = a.parse().map_err(|_| bad())?;
    let second: i32 = b.parse().map_err(|_| bad())?;
    if second != first + 1 {
        return Err(bad());
    }
    Ok(format!("{first}/{second}"))
}

pub fn req_session(params: &Value) -> Result<String, HandlerErr> {
    check_session(&req_str(params, "session")?)
}

pub fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{key} must be YYYY-MM-DD")))
}

pub fn req_date(params: &Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    parse_date(&req_str(params, key)?, key)
}

pub fn req_array<'a>(params: &'a Value, key: &str) -> Result<&'a Vec<Value>, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {key}")))
}

/// `{fileName, fileBase64}` from an upload request.
pub fn upload(params: &Value) -> Result<(String, Vec<u8>), HandlerErr> {
    let file_name = req_str(params, "fileName")?;
    let encoded = req_str(params, "fileBase64")?;
    let bytes = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| HandlerErr::bad_params(format!("fileBase64 is not valid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(HandlerErr::bad_params("uploaded file is empty"));
    }
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(HandlerErr::bad_params(format!(
            "uploaded file exceeds {} bytes",
            MAX_UPLOAD_BYTES
        )));
    }
    Ok((file_name, bytes))
}

pub fn limit(params: &Value, default: i64, max: i64) -> Result<i64, HandlerErr> {
    let n = opt_i64(params, "limit")?.unwrap_or(default);
    if n < 1 {
        return Err(HandlerErr::bad_params("limit must be positive"));
    }
    Ok(n.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sessions_must_be_consecutive_years() {
        assert_eq!(check_session(" 2024/2025 ").expect("ok"), "2024/2025");
        assert!(check_session("2024/2026").is_err());
        assert!(check_session("24/25").is_err());
        assert!(check_session("2024-2025").is_err());
    }

    #[test]
    fn patch_str_distinguishes_absent_and_null() {
        let p = json!({"a": null, "b": "  ", "c": " x "});
        assert_eq!(patch_str(&p, "missing").expect("ok"), None);
        assert_eq!(patch_str(&p, "a").expect("ok"), Some(None));
        assert_eq!(patch_str(&p, "b").expect("ok"), Some(None));
        assert_eq!(patch_str(&p, "c").expect("ok"), Some(Some("x".into())));
        assert!(patch_str(&json!({"a": 1}), "a").is_err());
    }

    #[test]
    fn term_range() {
        assert!(req_term(&json!({"term": 0})).is_err());
        assert_eq!(req_term(&json!({"term": 3})).expect("term"), 3);
        assert!(req_term(&json!({})).is_err());
    }

    #[test]
    fn upload_rejects_bad_base64() {
        assert!(upload(&json!({"fileName": "a.csv", "fileBase64": "!!"})).is_err());
        let (name, bytes) =
            upload(&json!({"fileName": "a.csv", "fileBase64": STANDARD.encode("x,y")})).expect("ok");
        assert_eq!(name, "a.csv");
        assert_eq!(bytes, b"x,y");
    }
}
