//! Runtime configuration.
//!
//! Values are resolved once at startup, from `WARDFLOW_*` environment
//! variables or any other key lookup, and then passed down explicitly.

use crate::sequence::SequenceScope;
use crate::{Result, WardflowError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Prefix of every environment variable read by [`WardflowConfig::from_env`].
pub const ENV_PREFIX: &str = "WARDFLOW_";

/// Default live view refresh interval in seconds.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;

/// Longest accepted refresh interval in seconds.
pub const MAX_REFRESH_INTERVAL_SECS: u64 = 120;

/// Task name that marks the OT branch by default.
pub const DEFAULT_BRANCH_MARKER: &str = "OT Information";

/// Settings shared by the handlers of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardflowConfig {
    /// Seconds between live view refreshes.
    pub refresh_interval_secs: u64,

    /// Buffered events per event bus subscriber.
    pub event_capacity: usize,

    /// Attempts for a completion that hits a stale version.
    pub write_attempts: u32,

    /// Attempts for an insert whose issued number collides.
    pub issue_attempts: u32,

    /// Number scope for task assignments.
    pub task_scope: SequenceScope,

    /// Number scope for lab records.
    pub lab_scope: SequenceScope,

    /// Number scope for discharge records.
    pub discharge_scope: SequenceScope,

    /// Task names that require a branch on completion.
    pub branch_markers: Vec<String>,

    /// SQLite database file, when the `sqlite` feature is used.
    pub database_path: Option<PathBuf>,
}

impl Default for WardflowConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            event_capacity: crate::event::DEFAULT_EVENT_CHANNEL_CAPACITY,
            write_attempts: 3,
            issue_attempts: 3,
            task_scope: SequenceScope::new("TASK"),
            lab_scope: SequenceScope::new("LAB"),
            discharge_scope: SequenceScope::new("DIS"),
            branch_markers: vec![DEFAULT_BRANCH_MARKER.to_string()],
            database_path: None,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| WardflowError::Config(format!("{}{} = {:?}", ENV_PREFIX, key, raw)))
}

impl WardflowConfig {
    /// Reads the process environment and validates the result.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary lookup of full variable names.
    ///
    /// Recognized keys (after [`ENV_PREFIX`]): `REFRESH_INTERVAL_SECS`,
    /// `EVENT_CAPACITY`, `WRITE_ATTEMPTS`, `ISSUE_ATTEMPTS`, `TASK_PREFIX`,
    /// `TASK_WIDTH`, `LAB_PREFIX`, `DISCHARGE_PREFIX`, `BRANCH_MARKERS`
    /// (comma separated) and `DATABASE_PATH`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(&format!("{}{}", ENV_PREFIX, key));
        let mut config = Self::default();

        if let Some(raw) = get("REFRESH_INTERVAL_SECS") {
            config.refresh_interval_secs = parse_var("REFRESH_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = get("EVENT_CAPACITY") {
            config.event_capacity = parse_var("EVENT_CAPACITY", &raw)?;
        }
        if let Some(raw) = get("WRITE_ATTEMPTS") {
            config.write_attempts = parse_var("WRITE_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = get("ISSUE_ATTEMPTS") {
            config.issue_attempts = parse_var("ISSUE_ATTEMPTS", &raw)?;
        }
        if let Some(prefix) = get("TASK_PREFIX") {
            config.task_scope.prefix = prefix.trim().to_string();
        }
        if let Some(raw) = get("TASK_WIDTH") {
            config.task_scope.width = parse_var("TASK_WIDTH", &raw)?;
        }
        if let Some(prefix) = get("LAB_PREFIX") {
            config.lab_scope.prefix = prefix.trim().to_string();
        }
        if let Some(prefix) = get("DISCHARGE_PREFIX") {
            config.discharge_scope.prefix = prefix.trim().to_string();
        }
        if let Some(raw) = get("BRANCH_MARKERS") {
            config.branch_markers = raw
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(path) = get("DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks ranges and non-empty values.
    ///
    /// # Errors
    ///
    /// Returns [`WardflowError::Config`] naming the first bad setting.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_REFRESH_INTERVAL_SECS).contains(&self.refresh_interval_secs) {
            return Err(WardflowError::Config(format!(
                "refresh_interval_secs must be between 1 and {}, got {}",
                MAX_REFRESH_INTERVAL_SECS, self.refresh_interval_secs
            )));
        }
        if self.event_capacity == 0 {
            return Err(WardflowError::Config(
                "event_capacity must be positive".to_string(),
            ));
        }
        if self.write_attempts == 0 || self.issue_attempts == 0 {
            return Err(WardflowError::Config(
                "write_attempts and issue_attempts must be positive".to_string(),
            ));
        }
        for (name, scope) in [
            ("task_scope", &self.task_scope),
            ("lab_scope", &self.lab_scope),
            ("discharge_scope", &self.discharge_scope),
        ] {
            if scope.prefix.is_empty() || scope.prefix.contains('-') {
                return Err(WardflowError::Config(format!(
                    "{} prefix must be non-empty and contain no '-': {:?}",
                    name, scope.prefix
                )));
            }
        }
        Ok(())
    }

    /// The refresh interval as a [`Duration`].
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = WardflowConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.branch_markers, vec!["OT Information"]);
        assert_eq!(config.task_scope.format(1), "TASK-001");
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = WardflowConfig::from_lookup(lookup(&[
            ("WARDFLOW_REFRESH_INTERVAL_SECS", "10"),
            ("WARDFLOW_TASK_PREFIX", "RT"),
            ("WARDFLOW_TASK_WIDTH", "4"),
            ("WARDFLOW_BRANCH_MARKERS", "OT Information, Cath Lab ,"),
            ("WARDFLOW_DATABASE_PATH", "/tmp/wardflow.db"),
        ]))
        .unwrap();

        assert_eq!(config.refresh_interval_secs, 10);
        assert_eq!(config.task_scope.format(7), "RT-0007");
        assert_eq!(config.branch_markers, vec!["OT Information", "Cath Lab"]);
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/wardflow.db")));
    }

    #[test]
    fn test_refresh_interval_out_of_range() {
        for raw in ["0", "121"] {
            let err = WardflowConfig::from_lookup(lookup(&[(
                "WARDFLOW_REFRESH_INTERVAL_SECS",
                raw,
            )]))
            .unwrap_err();
            assert!(matches!(err, WardflowError::Config(_)));
        }
    }

    #[test]
    fn test_unparsable_value() {
        let err =
            WardflowConfig::from_lookup(lookup(&[("WARDFLOW_WRITE_ATTEMPTS", "three")]))
                .unwrap_err();
        assert!(err.to_string().contains("WARDFLOW_WRITE_ATTEMPTS"));
    }

    #[test]
    fn test_prefix_with_dash_rejected() {
        let err = WardflowConfig::from_lookup(lookup(&[("WARDFLOW_LAB_PREFIX", "LAB-X")]))
            .unwrap_err();
        assert!(matches!(err, WardflowError::Config(_)));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: WardflowConfig =
            serde_json::from_str(r#"{"refresh_interval_secs": 5}"#).unwrap();
        assert_eq!(config.refresh_interval_secs, 5);
        assert_eq!(config.issue_attempts, 3);
    }
}
