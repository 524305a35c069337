use crate::auth::{AuthError, Caller, Role};
use crate::calc::CalcError;
use crate::config::Config;
use crate::ipc::error::{err, ok};
use crate::sources::{ReportError, SourceError};
use crate::store::{self, UserRow};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::Connection;
use serde_json::json;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        Self::new(e.code(), e.to_string()).with_details(e.details())
    }
}

impl From<SourceError> for HandlerErr {
    fn from(e: SourceError) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

impl From<ReportError> for HandlerErr {
    fn from(e: ReportError) -> Self {
        match e {
            ReportError::Calc(c) => c.into(),
            ReportError::Source(s) => s.into(),
        }
    }
}

impl From<AuthError> for HandlerErr {
    fn from(e: AuthError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

pub fn respond(id: &str, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

/// Per-request view handed to the handler families.
pub struct Ctx<'a> {
    pub conn: &'a Connection,
    pub caller: Option<&'a Caller>,
    pub config: &'a Config,
    pub token: Option<&'a str>,
}

impl Ctx<'_> {
    pub fn caller(&self) -> Result<&Caller, HandlerErr> {
        self.caller.ok_or_else(|| HandlerErr::new("unauthorized", "Authentication required"))
    }

    /// Students may only read their own records; staff may read anyone's.
    pub fn check_student_scope(&self, student_id: &str) -> Result<(), HandlerErr> {
        let caller = self.caller()?;
        if caller.is(Role::Student) && caller.user_id != student_id {
            return Err(HandlerErr::forbidden("Access denied"));
        }
        Ok(())
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_optional_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|x| x.is_finite())
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    get_optional_f64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .or_else(|| v.as_f64().filter(|x| x.fract() == 0.0).map(|x| x as i64))
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    get_optional_i64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_bool(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn get_str_list(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(items) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("{} must be an array", key)));
    };
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must contain ids", key)))
        })
        .collect()
}

pub fn check_len(value: &str, label: &str, min: usize, max: Option<usize>) -> Result<(), HandlerErr> {
    let n = value.chars().count();
    match max {
        Some(max) if n < min || n > max => Err(HandlerErr::bad_params(format!(
            "{} must be between {} and {} characters",
            label, min, max
        ))),
        None if n < min => Err(HandlerErr::bad_params(format!(
            "{} must be at least {} characters",
            label, min
        ))),
        _ => Ok(()),
    }
}

pub fn check_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    label: &str,
    min: T,
    max: Option<T>,
) -> Result<(), HandlerErr> {
    let too_big = max.as_ref().map_or(false, |m| value > *m);
    if value < min || too_big {
        let message = match max {
            Some(m) => format!("{} must be between {} and {}", label, min, m),
            None => format!("{} must be at least {}", label, min),
        };
        return Err(HandlerErr::bad_params(message));
    }
    Ok(())
}

/// Lower-cased address with a non-empty local part and a dotted domain.
pub fn normalize_email(raw: &str) -> Result<String, HandlerErr> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(HandlerErr::bad_params("Please provide a valid email"));
    }
    Ok(email)
}

pub fn parse_day_param(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be a YYYY-MM-DD date", key)))
}

/// RFC 3339 timestamp, or a bare date taken as midnight UTC.
pub fn parse_instant_param(raw: &str, key: &str) -> Result<DateTime<Utc>, HandlerErr> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .map_err(|_| HandlerErr::bad_params(format!("{} must be a date or RFC 3339 timestamp", key)))
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn fmt_day(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// Loads a user and checks its role; `label` names the entity in errors.
pub fn require_user_with_role(
    conn: &Connection,
    user_id: &str,
    role: Role,
    label: &str,
) -> Result<UserRow, HandlerErr> {
    let user = store::load_user(conn, user_id)?
        .ok_or_else(|| HandlerErr::not_found(format!("{} not found", label)))?;
    if user.role != role.as_str() {
        return Err(HandlerErr::bad_params(format!(
            "User is not a {}",
            role.as_str()
        ))
        .with_details(json!({ "userId": user_id, "role": user.role })));
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_normalization() {
        assert_eq!(
            normalize_email("  Ada@Example.COM ").ok().as_deref(),
            Some("ada@example.com")
        );
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("a@b").is_err());
        assert!(normalize_email("@b.com").is_err());
        assert!(normalize_email("a b@c.com").is_err());
    }

    #[test]
    fn instants_accept_dates_and_timestamps() {
        let a = parse_instant_param("2099-05-01", "date").ok().expect("date");
        let b = parse_instant_param("2099-05-01T00:00:00Z", "date")
            .ok()
            .expect("timestamp");
        assert_eq!(a, b);
        assert!(parse_instant_param("May 1st", "date").is_err());
        assert!(parse_day_param("2099-02-30", "date").is_err());
    }

    #[test]
    fn numeric_params() {
        let p = json!({ "n": 3, "f": 2.0, "bad": "x", "half": 1.5 });
        assert_eq!(get_optional_i64(&p, "n").ok().flatten(), Some(3));
        assert_eq!(get_optional_i64(&p, "f").ok().flatten(), Some(2));
        assert!(get_optional_i64(&p, "half").is_err());
        assert!(get_required_f64(&p, "bad").is_err());
        assert_eq!(get_optional_f64(&p, "missing").ok().flatten(), None);
    }

    #[test]
    fn length_and_range_checks() {
        assert!(check_len("ab", "Name", 2, Some(50)).is_ok());
        assert!(check_len("a", "Name", 2, Some(50)).is_err());
        assert!(check_len("short", "Description", 10, None).is_err());
        assert!(check_range(5, "Duration", 1, Some(36)).is_ok());
        assert!(check_range(37, "Duration", 1, Some(36)).is_err());
        assert!(check_range(-1.0, "Fees", 0.0, None).is_err());
    }
}
