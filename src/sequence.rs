//! Human-readable sequential identifiers.
//!
//! The issuer reads the highest number issued so far for a scope and hands
//! out the next one. The read and the later insert are not serialized, so
//! two concurrent submissions can draw the same number; stores reject the
//! second insert with [`WardflowError::DuplicateNumber`] and callers
//! re-issue. Within one submission, rows take `base + i` from a single
//! issued base.

use crate::{Result, WardflowError};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default zero-padding width for issued numbers.
pub const DEFAULT_WIDTH: usize = 3;

/// Something that knows the highest number issued for a scope.
#[async_trait]
pub trait SequenceSource: Send + Sync {
    /// Highest numeric suffix issued for `scope`, or `None` if the scope is
    /// empty.
    async fn max_issued(&self, scope: &str) -> Result<Option<u64>>;
}

/// A named number sequence, e.g. `LAB` or `TASK`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceScope {
    /// Identifier prefix, without the dash.
    pub prefix: String,

    /// Minimum digit count.
    #[serde(default = "default_width")]
    pub width: usize,
}

fn default_width() -> usize {
    DEFAULT_WIDTH
}

impl SequenceScope {
    /// Creates a scope with the default width.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            width: DEFAULT_WIDTH,
        }
    }

    /// Sets the zero-padding width.
    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    /// Formats `value` as `PREFIX-000value`.
    pub fn format(&self, value: u64) -> String {
        format!("{}-{:0width$}", self.prefix, value, width = self.width)
    }

    /// Extracts the numeric suffix of an identifier in this scope.
    pub fn parse(&self, id: &str) -> Option<u64> {
        id.strip_prefix(&self.prefix)?
            .strip_prefix('-')?
            .parse()
            .ok()
    }
}

/// A number drawn from a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedNumber {
    /// Scope the number belongs to.
    pub scope: SequenceScope,

    /// Numeric value.
    pub value: u64,

    /// True when the sequence could not be read and the value is
    /// time-derived. Uniqueness is then best effort only.
    pub degraded: bool,
}

impl IssuedNumber {
    /// Formatted identifier for the issued value.
    pub fn id(&self) -> String {
        self.scope.format(self.value)
    }

    /// Value `i` positions after the base, as `(value, formatted id)`.
    ///
    /// Saturates at `u64::MAX`; the store rejects the repeated number.
    pub fn offset(&self, i: u64) -> (u64, String) {
        let value = self.value.saturating_add(i);
        (value, self.scope.format(value))
    }
}

/// Issues sequential identifiers from a [`SequenceSource`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskNumberIssuer;

impl TaskNumberIssuer {
    /// Creates an issuer.
    pub fn new() -> Self {
        Self
    }

    /// Issues the next number in `scope`.
    ///
    /// An empty scope starts at 1. If the source cannot be read or the scope
    /// has no number left, the issuer does not block or fail: it logs the
    /// degradation and returns the current Unix time in milliseconds as the
    /// value.
    pub async fn next<S>(&self, source: &S, scope: &SequenceScope) -> IssuedNumber
    where
        S: SequenceSource + ?Sized,
    {
        let reason = match source.max_issued(&scope.prefix).await {
            Ok(None) => return Self::issued(scope, 1),
            Ok(Some(max)) => match max.checked_add(1) {
                Some(value) => return Self::issued(scope, value),
                None => format!("sequence exhausted at {}", max),
            },
            Err(e) => e.to_string(),
        };

        let degraded = WardflowError::SequenceDegraded(scope.prefix.clone());
        warn!(error = %reason, "{}; falling back to time-derived number", degraded);
        IssuedNumber {
            scope: scope.clone(),
            value: Utc::now().timestamp_millis().unsigned_abs(),
            degraded: true,
        }
    }

    fn issued(scope: &SequenceScope, value: u64) -> IssuedNumber {
        debug!(scope = %scope.prefix, value, "issued sequence number");
        IssuedNumber {
            scope: scope.clone(),
            value,
            degraded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Option<u64>);

    #[async_trait]
    impl SequenceSource for FixedSource {
        async fn max_issued(&self, _scope: &str) -> Result<Option<u64>> {
            Ok(self.0)
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl SequenceSource for BrokenSource {
        async fn max_issued(&self, _scope: &str) -> Result<Option<u64>> {
            Err(WardflowError::Storage("connection reset".to_string()))
        }
    }

    #[test]
    fn test_format_pads_to_width() {
        let scope = SequenceScope::new("LAB");
        assert_eq!(scope.format(1), "LAB-001");
        assert_eq!(scope.format(42), "LAB-042");
        assert_eq!(scope.format(1234), "LAB-1234");
        assert_eq!(SequenceScope::new("TASK").with_width(4).format(7), "TASK-0007");
    }

    #[test]
    fn test_parse_suffix() {
        let scope = SequenceScope::new("LAB");
        assert_eq!(scope.parse("LAB-041"), Some(41));
        assert_eq!(scope.parse("LAB-1000"), Some(1000));
        assert_eq!(scope.parse("LABX-041"), None);
        assert_eq!(scope.parse("DIS-041"), None);
        assert_eq!(scope.parse("LAB-abc"), None);
    }

    #[tokio::test]
    async fn test_empty_scope_starts_at_one() {
        let issued = TaskNumberIssuer::new()
            .next(&FixedSource(None), &SequenceScope::new("LAB"))
            .await;
        assert_eq!(issued.id(), "LAB-001");
        assert!(!issued.degraded);
    }

    #[tokio::test]
    async fn test_increments_prior_max() {
        let issued = TaskNumberIssuer::new()
            .next(&FixedSource(Some(41)), &SequenceScope::new("LAB"))
            .await;
        assert_eq!(issued.id(), "LAB-042");
    }

    #[tokio::test]
    async fn test_offsets_are_distinct() {
        let issued = TaskNumberIssuer::new()
            .next(&FixedSource(Some(9)), &SequenceScope::new("TASK"))
            .await;
        let ids: Vec<String> = (0..3).map(|i| issued.offset(i).1).collect();
        assert_eq!(ids, vec!["TASK-010", "TASK-011", "TASK-012"]);
    }

    #[tokio::test]
    async fn test_exhausted_scope_degrades() {
        let issued = TaskNumberIssuer::new()
            .next(&FixedSource(Some(u64::MAX)), &SequenceScope::new("LAB"))
            .await;
        assert!(issued.degraded);
        assert!(issued.value < u64::MAX);
        assert_eq!(issued.offset(1).0, issued.value + 1);
    }

    #[test]
    fn test_offset_saturates() {
        let issued = IssuedNumber {
            scope: SequenceScope::new("TASK"),
            value: u64::MAX - 1,
            degraded: false,
        };
        assert_eq!(issued.offset(5).0, u64::MAX);
    }

    #[tokio::test]
    async fn test_read_failure_degrades_to_time_derived() {
        let before = Utc::now().timestamp_millis().unsigned_abs();
        let issued = TaskNumberIssuer::new()
            .next(&BrokenSource, &SequenceScope::new("TASK"))
            .await;
        assert!(issued.degraded);
        assert!(issued.value >= before);
        assert!(issued.id().starts_with("TASK-"));
    }
}
