//! Picking one version among validity slices.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use moldap_common::{Error, Result};

use crate::model::{Engagement, HasValidity};

/// Pick the version valid at `now`, else the one with the latest end.
///
/// An open end sorts after every closed one. Should several versions be
/// current at once, the latest-ending of them wins.
///
/// # Errors
/// - `NotFound` if there are no versions
pub fn select_current_or_latest<T: HasValidity>(versions: Vec<T>, now: DateTime<Utc>) -> Result<T> {
    let (current, rest): (Vec<T>, Vec<T>) = versions
        .into_iter()
        .partition(|v| v.validity().is_current_at(now));
    let pool = if current.is_empty() { rest } else { current };
    pool.into_iter()
        .max_by(|a, b| a.validity().cmp_end(&b.validity()))
        .ok_or_else(|| Error::NotFound("No versions to select from".to_string()))
}

/// The person's primary engagement among all its engagement slices.
///
/// Returns `None` only when there are no slices at all.
///
/// # Errors
/// - `TransientInconsistency` if slices exist but none is primary, or if
///   slices of more than one engagement are primary at `now`
pub fn resolve_primary(slices: Vec<Engagement>, now: DateTime<Utc>) -> Result<Option<Engagement>> {
    if slices.is_empty() {
        return Ok(None);
    }
    let primary: Vec<Engagement> = slices.into_iter().filter(|e| e.is_primary).collect();
    if primary.is_empty() {
        return Err(Error::TransientInconsistency(
            "Engagements exist but none is primary".to_string(),
        ));
    }
    let current_primary: HashSet<_> = primary
        .iter()
        .filter(|e| e.validity.is_current_at(now))
        .map(|e| e.uuid)
        .collect();
    if current_primary.len() > 1 {
        return Err(Error::TransientInconsistency(format!(
            "{} engagements are primary at the same time",
            current_primary.len()
        )));
    }
    select_current_or_latest(primary, now).map(Some)
}
