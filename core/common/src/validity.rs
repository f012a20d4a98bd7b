//! Validity windows of remote record versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Half-open interval `[from, to)` during which a record version is in force.
///
/// A missing bound is open: `from = None` extends to minus infinity and
/// `to = None` to plus infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Validity {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl Validity {
    /// Create a validity window.
    ///
    /// # Errors
    /// - Returns error if both bounds are present and `from > to`
    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> crate::Result<Self> {
        if let (Some(start), Some(end)) = (from, to) {
            if start > end {
                return Err(crate::Error::InvalidInput(format!(
                    "Validity start {} is after end {}",
                    start, end
                )));
            }
        }
        Ok(Self { from, to })
    }

    /// Window starting at `from` with no end.
    pub fn open_from(from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    /// Window open in both directions.
    pub fn unbounded() -> Self {
        Self { from: None, to: None }
    }

    /// `from <= now < to`, with open bounds always satisfied.
    pub fn is_current_at(&self, now: DateTime<Utc>) -> bool {
        let started = self.from.is_none_or(|start| start <= now);
        let not_ended = self.to.is_none_or(|end| now < end);
        started && not_ended
    }

    /// Order by end bound, an open end sorting after every closed one.
    pub fn cmp_end(&self, other: &Validity) -> Ordering {
        match (self.to, other.to) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(&b),
        }
    }
}

impl Default for Validity {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let from = self.from.map(|d| d.to_rfc3339()).unwrap_or_else(|| "-inf".into());
        let to = self.to.map(|d| d.to_rfc3339()).unwrap_or_else(|| "+inf".into());
        write!(f, "[{}, {})", from, to)
    }
}
