//! Elapsed-time classification for completed stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How late a stage was completed relative to its planned time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delay {
    /// Completed within the same hour as planned, or earlier.
    OnTime,
    /// Completed whole hours after the planned time.
    Late {
        /// Elapsed whole hours, truncated.
        hours: i64,
    },
}

impl Delay {
    /// Classifies `actual - planned`, truncated to whole hours.
    ///
    /// A non-positive hour count is on time.
    pub fn between(planned: DateTime<Utc>, actual: DateTime<Utc>) -> Self {
        let hours = (actual - planned).num_hours();
        if hours <= 0 {
            Self::OnTime
        } else {
            Self::Late { hours }
        }
    }

    /// Returns true for [`Delay::OnTime`].
    pub fn is_on_time(&self) -> bool {
        matches!(self, Self::OnTime)
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnTime => write!(f, "On Time"),
            Self::Late { hours } => write!(f, "{} hours delay", hours),
        }
    }
}
