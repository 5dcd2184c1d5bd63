//! Interval model - begin/optional-end time ranges for dated actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::services::ServiceError;

/// A half-open time range `[begin, end)`.
///
/// `end == None` means the range is still open (unbounded). It is compared as
/// +infinity and never materialized as a concrete timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Interval {
    begin: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
}

impl Interval {
    /// Create a new interval, rejecting a finite end before begin.
    pub fn new(begin: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Result<Self, ServiceError> {
        if let Some(end) = end {
            if end < begin {
                return Err(ServiceError::InvalidRange { begin, end });
            }
        }
        Ok(Self { begin, end })
    }

    /// Interval starting at `begin` with no end.
    pub fn open(begin: DateTime<Utc>) -> Self {
        Self { begin, end: None }
    }

    /// Interval with both bounds set.
    pub fn closed(begin: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ServiceError> {
        Self::new(begin, Some(end))
    }

    /// Build from bounds the caller already knows are ordered.
    pub(crate) fn span(begin: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        debug_assert!(end.is_none_or(|end| begin <= end));
        Self { begin, end }
    }

    pub fn begin(&self) -> DateTime<Utc> {
        self.begin
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// True iff both intervals share at least one instant.
    ///
    /// Boundaries are exclusive hand-offs: `a.end == b.begin` is not an overlap.
    pub fn overlaps(&self, other: &Interval) -> bool {
        let start = self.begin.max(other.begin);
        match (self.end, other.end) {
            (None, None) => true,
            (Some(end), None) | (None, Some(end)) => start < end,
            (Some(a), Some(b)) => start < a.min(b),
        }
    }

    /// True iff `instant` lies in `[begin, end)`.
    pub fn covers(&self, instant: DateTime<Utc>) -> bool {
        self.begin <= instant && self.end.is_none_or(|end| instant < end)
    }

    /// True iff `other` lies entirely inside this interval.
    pub fn contains(&self, other: &Interval) -> bool {
        if other.begin < self.begin {
            return false;
        }
        match (self.end, other.end) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(outer), Some(inner)) => inner <= outer,
        }
    }

    /// The shared part of both intervals, if they overlap.
    pub fn intersection(&self, other: &Interval) -> Option<Interval> {
        if !self.overlaps(other) {
            return None;
        }
        let end = match (self.end, other.end) {
            (None, None) => None,
            (Some(end), None) | (None, Some(end)) => Some(end),
            (Some(a), Some(b)) => Some(a.min(b)),
        };
        Some(Interval {
            begin: self.begin.max(other.begin),
            end,
        })
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {})", self.begin.to_rfc3339(), end.to_rfc3339()),
            None => write!(f, "[{}, ..)", self.begin.to_rfc3339()),
        }
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            begin: DateTime<Utc>,
            end: Option<DateTime<Utc>>,
        }

        let raw = Raw::deserialize(deserializer)?;
        Interval::new(raw.begin, raw.end).map_err(serde::de::Error::custom)
    }
}
