//! Runtime configuration, read once from the environment.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Only required for the Postgres sink.
    pub db_url: Option<String>,
    pub db_schema: Option<String>,
    pub db_max_connections: u32,
    pub landing_dir: PathBuf,
    pub run_date: NaiveDate,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let run_date = match var("RUN_DATE").filter(|s| !s.trim().is_empty()) {
            Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .with_context(|| format!("RUN_DATE '{}' is not YYYY-MM-DD", raw))?,
            None => Local::now().date_naive(),
        };
        Ok(Self {
            db_url: var("DB_URL"),
            db_schema: var("DB_SCHEMA").filter(|s| !s.is_empty()),
            db_max_connections: var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|| "5".to_string())
                .parse()
                .unwrap_or(5),
            landing_dir: PathBuf::from(var("LANDING_DIR").unwrap_or_else(|| "./data/landing".to_string())),
            run_date,
        })
    }

    pub fn require_db_url(&self) -> Result<&str> {
        self.db_url.as_deref().context("DB_URL env var missing")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert!(config.db_url.is_none());
        assert_eq!(config.db_max_connections, 5);
        assert_eq!(config.landing_dir, PathBuf::from("./data/landing"));
        assert!(config.require_db_url().is_err());
    }

    #[test]
    fn test_run_date_override() {
        let config = config(&[("RUN_DATE", "2024-06-02"), ("DB_MAX_CONNECTIONS", "oops")]).unwrap();
        assert_eq!(config.run_date, NaiveDate::from_ymd_opt(2024, 6, 2).unwrap());
        assert_eq!(config.db_max_connections, 5);
    }

    #[test]
    fn test_bad_run_date_is_an_error() {
        assert!(config(&[("RUN_DATE", "02/06/2024")]).is_err());
    }
}
