//! Reconciliation of candidate objects against existing remote objects.
//!
//! Candidates are matched to existing objects by a per-kind match key:
//! - Address: (person or unit, address type)
//! - Engagement: (person, user key)
//! - IT user: (person, IT system)
//! - Person and org unit: their own UUID
//!
//! No match creates, one match edits, several matches are skipped with a
//! warning.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use moldap_common::{Error, Result};
use moldap_remote::{MoObject, WriteRequest};

use crate::mapping::Candidate;

/// Fields never copied from a candidate onto a matched object.
const PROTECTED_FIELDS: [&str; 3] = ["uuid", "validity", "type"];

/// Identity used to pair a candidate with an existing object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchKey {
    Address { owner: Uuid, address_type: Uuid },
    Engagement { person: Uuid, user_key: String },
    ItUser { person: Uuid, itsystem: Uuid },
    Identity(Uuid),
}

/// The match key of an object; `None` for an address with no owner.
pub fn match_key(object: &MoObject) -> Option<MatchKey> {
    match object {
        MoObject::Address(a) => a.person.or(a.org_unit).map(|owner| MatchKey::Address {
            owner,
            address_type: a.address_type,
        }),
        MoObject::Engagement(e) => Some(MatchKey::Engagement {
            person: e.person,
            user_key: e.user_key.clone(),
        }),
        MoObject::ItUser(i) => i.person.map(|person| MatchKey::ItUser {
            person,
            itsystem: i.itsystem,
        }),
        MoObject::Person(p) => Some(MatchKey::Identity(p.uuid)),
        MoObject::OrgUnit(o) => Some(MatchKey::Identity(o.uuid)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The merged object equals the existing one.
    Identical,
    /// Several existing objects share the candidate's match key.
    AmbiguousMatch(usize),
    /// A termination with nothing to terminate.
    NothingToTerminate,
    /// The candidate has no usable match key.
    Unkeyed,
}

/// What to do with one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Create(MoObject),
    Edit(MoObject),
    Terminate { object: MoObject, at: DateTime<Utc> },
    Skip { uuid: Option<Uuid>, reason: SkipReason },
}

impl Decision {
    /// The remote write this decision calls for, if any.
    pub fn to_request(&self) -> Option<WriteRequest> {
        match self {
            Decision::Create(object) => Some(WriteRequest::create(object.clone())),
            Decision::Edit(object) => Some(WriteRequest::edit(object.clone())),
            Decision::Terminate { object, at } => Some(WriteRequest::terminate(object.clone(), *at)),
            Decision::Skip { .. } => None,
        }
    }
}

/// Drop non-primary engagements that share a user key with a primary one.
///
/// # Errors
/// - `TransientInconsistency` when engagements share a user key and zero or
///   several of them are primary
pub fn filter_duplicate_engagements(existing: Vec<MoObject>) -> Result<Vec<MoObject>> {
    let mut by_user_key: HashMap<String, Vec<(Uuid, bool)>> = HashMap::new();
    for object in &existing {
        if let MoObject::Engagement(e) = object {
            by_user_key
                .entry(e.user_key.clone())
                .or_default()
                .push((e.uuid, e.is_primary));
        }
    }

    let mut dropped: Vec<Uuid> = Vec::new();
    for (user_key, engagements) in &by_user_key {
        if engagements.len() < 2 {
            continue;
        }
        let primaries: Vec<Uuid> = engagements
            .iter()
            .filter(|(_, primary)| *primary)
            .map(|(uuid, _)| *uuid)
            .collect();
        let [primary] = primaries.as_slice() else {
            return Err(Error::TransientInconsistency(format!(
                "{} engagements share user_key '{}' with {} primary",
                engagements.len(),
                user_key,
                primaries.len()
            )));
        };
        debug!(user_key = %user_key, primary = %primary, "Removing engagements with identical user keys");
        dropped.extend(
            engagements
                .iter()
                .map(|(uuid, _)| *uuid)
                .filter(|uuid| uuid != primary),
        );
    }

    Ok(existing
        .into_iter()
        .filter(|object| !dropped.contains(&object.uuid()))
        .collect())
}

/// Decide create/edit/terminate/skip for each candidate.
///
/// Deterministic: the same candidates and existing objects always yield the
/// same decisions.
///
/// # Errors
/// - `TransientInconsistency` from [`filter_duplicate_engagements`]
/// - `Serialization` if a merged object no longer forms a valid object
pub fn reconcile(candidates: &[Candidate], existing: &[MoObject]) -> Result<Vec<Decision>> {
    let existing = filter_duplicate_engagements(existing.to_vec())?;

    let mut by_key: HashMap<MatchKey, Vec<&MoObject>> = HashMap::new();
    for object in &existing {
        if let Some(key) = match_key(object) {
            by_key.entry(key).or_default().push(object);
        }
    }
    let mut candidates_per_key: HashMap<MatchKey, usize> = HashMap::new();
    for candidate in candidates {
        if let Some(key) = match_key(&candidate.object) {
            *candidates_per_key.entry(key).or_default() += 1;
        }
    }

    candidates
        .iter()
        .map(|candidate| {
            let Some(key) = match_key(&candidate.object) else {
                warn!(uuid = %candidate.object.uuid(), "Candidate has no match key, skipping");
                return Ok(Decision::Skip {
                    uuid: Some(candidate.object.uuid()),
                    reason: SkipReason::Unkeyed,
                });
            };
            let matches = by_key.get(&key).map(Vec::as_slice).unwrap_or_default();
            let siblings = candidates_per_key.get(&key).copied().unwrap_or(1);
            decide(candidate, matches, siblings)
        })
        .collect()
}

fn decide(candidate: &Candidate, matches: &[&MoObject], siblings: usize) -> Result<Decision> {
    let matched = match matches {
        [] => None,
        [single] if siblings == 1 => Some(*single),
        _ => match candidate_value(&candidate.object) {
            // Several addresses of one type: pair them by value.
            Some(value) => {
                let same: Vec<&MoObject> = matches
                    .iter()
                    .copied()
                    .filter(|m| candidate_value(m) == Some(value))
                    .collect();
                match same.as_slice() {
                    [one] => Some(*one),
                    [] if siblings > 1 => None,
                    _ => return Ok(ambiguous(candidate, matches.len())),
                }
            }
            None => return Ok(ambiguous(candidate, matches.len())),
        },
    };

    match (matched, candidate.terminate_at) {
        (None, Some(_)) => {
            debug!(uuid = %candidate.object.uuid(), "Nothing to terminate");
            Ok(Decision::Skip {
                uuid: None,
                reason: SkipReason::NothingToTerminate,
            })
        }
        (None, None) => Ok(Decision::Create(candidate.object.clone())),
        (Some(existing), Some(at)) => Ok(Decision::Terminate {
            object: existing.clone(),
            at,
        }),
        (Some(existing), None) => {
            let merged = merge(existing, candidate)?;
            if serde_json::to_value(&merged)? == serde_json::to_value(existing)? {
                Ok(Decision::Skip {
                    uuid: Some(existing.uuid()),
                    reason: SkipReason::Identical,
                })
            } else {
                Ok(Decision::Edit(merged))
            }
        }
    }
}

fn ambiguous(candidate: &Candidate, count: usize) -> Decision {
    warn!(
        kind = %candidate.object.kind(),
        matches = count,
        "Several existing objects match candidate, skipping"
    );
    Decision::Skip {
        uuid: None,
        reason: SkipReason::AmbiguousMatch(count),
    }
}

fn candidate_value(object: &MoObject) -> Option<&str> {
    match object {
        MoObject::Address(a) => Some(a.value.as_str()),
        _ => None,
    }
}

/// Copy the candidate's mapped fields onto the existing object, keeping its
/// identity, validity and every field the mapping does not produce.
fn merge(existing: &MoObject, candidate: &Candidate) -> Result<MoObject> {
    let mut target = serde_json::to_value(existing)?;
    let source = serde_json::to_value(&candidate.object)?;
    if let (Value::Object(target), Value::Object(source)) = (&mut target, &source) {
        for field in &candidate.mapped_fields {
            if PROTECTED_FIELDS.contains(&field.as_str()) {
                continue;
            }
            if let Some(value) = source.get(field) {
                target.insert(field.clone(), value.clone());
            }
        }
    }
    let mut merged: MoObject = serde_json::from_value(target)?;
    if let (MoObject::Engagement(merged), MoObject::Engagement(existing)) = (&mut merged, existing) {
        merged.is_primary = existing.is_primary;
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use moldap_common::Validity;
    use moldap_remote::{Address, Engagement, Person};
    use std::collections::BTreeSet;

    fn address(person: Uuid, address_type: Uuid, value: &str) -> Address {
        Address {
            uuid: Uuid::new_v4(),
            user_key: None,
            value: value.to_string(),
            address_type,
            person: Some(person),
            org_unit: None,
            engagement: None,
            visibility: None,
            validity: Validity::unbounded(),
        }
    }

    fn engagement(person: Uuid, user_key: &str, primary: bool) -> Engagement {
        Engagement {
            uuid: Uuid::new_v4(),
            user_key: user_key.to_string(),
            org_unit: Uuid::nil(),
            person,
            job_function: Uuid::nil(),
            engagement_type: Uuid::nil(),
            primary: None,
            is_primary: primary,
            extension_1: None,
            extension_2: None,
            extension_3: None,
            validity: Validity::unbounded(),
        }
    }

    fn candidate(object: MoObject, fields: &[&str]) -> Candidate {
        Candidate {
            object,
            mapped_fields: fields.iter().map(|f| f.to_string()).collect::<BTreeSet<_>>(),
            terminate_at: None,
        }
    }

    #[test]
    fn test_no_match_creates() {
        let person = Uuid::new_v4();
        let object = MoObject::Address(address(person, Uuid::nil(), "a@x.dk"));
        let decisions = reconcile(&[candidate(object.clone(), &["value"])], &[]).unwrap();
        assert_eq!(decisions, vec![Decision::Create(object)]);
    }

    #[test]
    fn test_single_match_edits_keeping_identity_and_unmapped_fields() {
        let person = Uuid::new_v4();
        let mut existing = address(person, Uuid::nil(), "old@x.dk");
        existing.visibility = Some(Uuid::new_v4());
        let incoming = address(person, Uuid::nil(), "new@x.dk");

        let decisions = reconcile(
            &[candidate(MoObject::Address(incoming), &["value", "person"])],
            &[MoObject::Address(existing.clone())],
        )
        .unwrap();

        let Decision::Edit(MoObject::Address(edited)) = &decisions[0] else {
            panic!("expected an edit, got {:?}", decisions);
        };
        assert_eq!(edited.uuid, existing.uuid);
        assert_eq!(edited.value, "new@x.dk");
        assert_eq!(edited.visibility, existing.visibility);
        assert_eq!(edited.validity, existing.validity);
    }

    #[test]
    fn test_identical_is_skipped() {
        let person = Uuid::new_v4();
        let existing = address(person, Uuid::nil(), "a@x.dk");
        let incoming = address(person, Uuid::nil(), "a@x.dk");
        let decisions = reconcile(
            &[candidate(MoObject::Address(incoming), &["value"])],
            &[MoObject::Address(existing.clone())],
        )
        .unwrap();
        assert_eq!(
            decisions,
            vec![Decision::Skip {
                uuid: Some(existing.uuid),
                reason: SkipReason::Identical
            }]
        );
    }

    #[test]
    fn test_multiple_matches_skipped() {
        let person = Uuid::new_v4();
        let existing = vec![
            MoObject::Address(address(person, Uuid::nil(), "a@x.dk")),
            MoObject::Address(address(person, Uuid::nil(), "b@x.dk")),
        ];
        let incoming = address(person, Uuid::nil(), "c@x.dk");
        let decisions = reconcile(&[candidate(MoObject::Address(incoming), &["value"])], &existing).unwrap();
        assert_eq!(
            decisions,
            vec![Decision::Skip {
                uuid: None,
                reason: SkipReason::AmbiguousMatch(2)
            }]
        );
    }

    #[test]
    fn test_multi_valued_addresses_pair_by_value() {
        let person = Uuid::new_v4();
        let existing = address(person, Uuid::nil(), "a@x.dk");
        let candidates = vec![
            candidate(MoObject::Address(address(person, Uuid::nil(), "a@x.dk")), &["value"]),
            candidate(MoObject::Address(address(person, Uuid::nil(), "b@x.dk")), &["value"]),
        ];
        let decisions = reconcile(&candidates, &[MoObject::Address(existing)]).unwrap();
        assert!(matches!(decisions[0], Decision::Skip { reason: SkipReason::Identical, .. }));
        assert!(matches!(&decisions[1], Decision::Create(MoObject::Address(a)) if a.value == "b@x.dk"));
    }

    #[test]
    fn test_terminate_matched_and_unmatched() {
        let person = Uuid::new_v4();
        let existing = address(person, Uuid::nil(), "a@x.dk");
        let at = Utc::now();
        let mut flagged = candidate(MoObject::Address(address(person, Uuid::nil(), "a@x.dk")), &["value"]);
        flagged.terminate_at = Some(at);

        let decisions = reconcile(
            std::slice::from_ref(&flagged),
            &[MoObject::Address(existing.clone())],
        )
        .unwrap();
        assert_eq!(
            decisions,
            vec![Decision::Terminate {
                object: MoObject::Address(existing),
                at
            }]
        );

        let decisions = reconcile(&[flagged], &[]).unwrap();
        assert!(matches!(
            decisions[0],
            Decision::Skip {
                reason: SkipReason::NothingToTerminate,
                ..
            }
        ));
        assert!(decisions[0].to_request().is_none());
    }

    #[test]
    fn test_duplicate_engagements_reconcile_against_primary() {
        let person = Uuid::new_v4();
        let primary = engagement(person, "1234", true);
        let other = engagement(person, "1234", false);
        let existing = vec![MoObject::Engagement(other), MoObject::Engagement(primary.clone())];

        let mut incoming = engagement(person, "1234", false);
        incoming.extension_1 = Some("Konsulent".to_string());
        let decisions = reconcile(
            &[candidate(MoObject::Engagement(incoming), &["user_key", "extension_1"])],
            &existing,
        )
        .unwrap();

        let Decision::Edit(MoObject::Engagement(edited)) = &decisions[0] else {
            panic!("expected an edit, got {:?}", decisions);
        };
        assert_eq!(edited.uuid, primary.uuid);
        assert_eq!(edited.extension_1.as_deref(), Some("Konsulent"));
        assert!(edited.is_primary);
    }

    #[test]
    fn test_duplicate_engagements_without_single_primary_are_transient() {
        let person = Uuid::new_v4();
        for flags in [[false, false], [true, true]] {
            let existing = vec![
                MoObject::Engagement(engagement(person, "1234", flags[0])),
                MoObject::Engagement(engagement(person, "1234", flags[1])),
            ];
            assert!(matches!(
                filter_duplicate_engagements(existing),
                Err(Error::TransientInconsistency(_))
            ));
        }
    }

    #[test]
    fn test_three_duplicates_keep_only_primary() {
        let person = Uuid::new_v4();
        let primary = engagement(person, "1234", true);
        let existing = vec![
            MoObject::Engagement(engagement(person, "1234", false)),
            MoObject::Engagement(primary.clone()),
            MoObject::Engagement(engagement(person, "1234", false)),
            MoObject::Engagement(engagement(person, "5678", false)),
        ];
        let kept = filter_duplicate_engagements(existing).unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().any(|o| o.uuid() == primary.uuid));
    }

    #[test]
    fn test_person_matches_by_identity() {
        let uuid = Uuid::new_v4();
        let existing = Person {
            uuid,
            user_key: None,
            given_name: Some("Anna".to_string()),
            surname: Some("Hansen".to_string()),
            cpr_number: Some("0101011234".to_string()),
            nickname_given_name: None,
            nickname_surname: None,
            validity: Validity::unbounded(),
        };
        let mut incoming = existing.clone();
        incoming.surname = Some("Jensen".to_string());
        incoming.cpr_number = None;

        let decisions = reconcile(
            &[candidate(MoObject::Person(incoming), &["surname"])],
            &[MoObject::Person(existing)],
        )
        .unwrap();
        let Decision::Edit(MoObject::Person(edited)) = &decisions[0] else {
            panic!("expected an edit");
        };
        assert_eq!(edited.surname.as_deref(), Some("Jensen"));
        assert_eq!(edited.cpr_number.as_deref(), Some("0101011234"));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let person = Uuid::new_v4();
        let existing = vec![
            MoObject::Address(address(person, Uuid::nil(), "a@x.dk")),
            MoObject::Engagement(engagement(person, "1", true)),
        ];
        let candidates = vec![
            candidate(MoObject::Address(address(person, Uuid::nil(), "b@x.dk")), &["value"]),
            candidate(MoObject::Engagement(engagement(person, "1", false)), &["user_key"]),
            candidate(MoObject::Engagement(engagement(person, "2", false)), &["user_key"]),
        ];

        let first = reconcile(&candidates, &existing).unwrap();
        let second = reconcile(&candidates, &existing).unwrap();
        assert_eq!(first, second);
    }
}
