use std::path::PathBuf;

pub const DEFAULT_SESSION_TTL_HOURS: i64 = 7 * 24;
/// Ten years.
pub const MAX_SESSION_TTL_HOURS: i64 = 10 * 365 * 24;
pub const DEFAULT_BCRYPT_COST: u32 = 10;
const BCRYPT_COST_RANGE: std::ops::RangeInclusive<u32> = 4..=31;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Workspace opened at startup; `workspace.select` can still switch it.
    pub workspace: Option<PathBuf>,
    pub log_level: log::LevelFilter,
    pub session_ttl_hours: i64,
    pub bcrypt_cost: u32,
    /// Problems found while reading the environment. Reported once logging
    /// is up.
    pub warnings: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            log_level: log::LevelFilter::Info,
            session_ttl_hours: DEFAULT_SESSION_TTL_HOURS,
            bcrypt_cost: DEFAULT_BCRYPT_COST,
            warnings: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Config::default();

        cfg.workspace = lookup("INSTITUTED_WORKSPACE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        if let Some(raw) = lookup("INSTITUTED_LOG") {
            match raw.trim().parse::<log::LevelFilter>() {
                Ok(level) => cfg.log_level = level,
                Err(_) => cfg.warnings.push(format!(
                    "INSTITUTED_LOG={:?} is not a log level, using {}",
                    raw, DEFAULT_LOG_LEVEL
                )),
            }
        }

        if let Some(raw) = lookup("INSTITUTED_SESSION_TTL_HOURS") {
            match raw.trim().parse::<i64>() {
                Ok(h) if (1..=MAX_SESSION_TTL_HOURS).contains(&h) => cfg.session_ttl_hours = h,
                _ => cfg.warnings.push(format!(
                    "INSTITUTED_SESSION_TTL_HOURS={:?} is not between 1 and {}, using {}",
                    raw, MAX_SESSION_TTL_HOURS, DEFAULT_SESSION_TTL_HOURS
                )),
            }
        }

        if let Some(raw) = lookup("INSTITUTED_BCRYPT_COST") {
            match raw.trim().parse::<u32>() {
                Ok(c) if BCRYPT_COST_RANGE.contains(&c) => cfg.bcrypt_cost = c,
                _ => cfg.warnings.push(format!(
                    "INSTITUTED_BCRYPT_COST={:?} is not between {} and {}, using {}",
                    raw,
                    BCRYPT_COST_RANGE.start(),
                    BCRYPT_COST_RANGE.end(),
                    DEFAULT_BCRYPT_COST
                )),
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(lookup_from(&[]));
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.session_ttl_hours, 168);
    }

    #[test]
    fn reads_all_keys() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("INSTITUTED_WORKSPACE", "/tmp/inst"),
            ("INSTITUTED_LOG", "debug"),
            ("INSTITUTED_SESSION_TTL_HOURS", "12"),
            ("INSTITUTED_BCRYPT_COST", "4"),
        ]));
        assert_eq!(cfg.workspace, Some(PathBuf::from("/tmp/inst")));
        assert_eq!(cfg.log_level, log::LevelFilter::Debug);
        assert_eq!(cfg.session_ttl_hours, 12);
        assert_eq!(cfg.bcrypt_cost, 4);
        assert!(cfg.warnings.is_empty());
    }

    #[test]
    fn invalid_values_fall_back_with_warning() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("INSTITUTED_LOG", "chatty"),
            ("INSTITUTED_SESSION_TTL_HOURS", "-4"),
            ("INSTITUTED_WORKSPACE", "   "),
        ]));
        assert_eq!(cfg.log_level, log::LevelFilter::Info);
        assert_eq!(cfg.session_ttl_hours, DEFAULT_SESSION_TTL_HOURS);
        assert_eq!(cfg.workspace, None);
        assert_eq!(cfg.warnings.len(), 2);
    }

    #[test]
    fn session_ttl_and_cost_are_bounded() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("INSTITUTED_SESSION_TTL_HOURS", "100000000000"),
            ("INSTITUTED_BCRYPT_COST", "40"),
        ]));
        assert_eq!(cfg.session_ttl_hours, DEFAULT_SESSION_TTL_HOURS);
        assert_eq!(cfg.bcrypt_cost, DEFAULT_BCRYPT_COST);
        assert_eq!(cfg.warnings.len(), 2);

        let max = MAX_SESSION_TTL_HOURS.to_string();
        let cfg = Config::from_lookup(lookup_from(&[("INSTITUTED_SESSION_TTL_HOURS", max.as_str())]));
        assert_eq!(cfg.session_ttl_hours, MAX_SESSION_TTL_HOURS);
        assert!(cfg.warnings.is_empty());
    }
}
