//! Picking one directory account among several correlation candidates.

use serde::Deserialize;

use moldap_common::{Dn, Error, Result};

/// How the discriminator values are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscriminatorMode {
    /// Drop candidates whose attribute value is listed.
    Exclude,
    /// Take the first candidate, in value order, whose attribute value is listed.
    Include,
}

/// Configured rule selecting exactly one account among several candidates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Discriminator {
    /// Attribute read from every candidate.
    pub attribute: String,
    pub mode: DiscriminatorMode,
    /// Disallowed values (exclude) or priority-ordered accepted values (include).
    pub values: Vec<String>,
}

impl Discriminator {
    pub fn exclude(attribute: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            attribute: attribute.into(),
            mode: DiscriminatorMode::Exclude,
            values,
        }
    }

    pub fn include(attribute: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            attribute: attribute.into(),
            mode: DiscriminatorMode::Include,
            values,
        }
    }

    /// # Errors
    /// - `Configuration` if the attribute or value list is empty
    pub fn validate(&self) -> Result<()> {
        if self.attribute.trim().is_empty() {
            return Err(Error::Configuration(
                "Discriminator attribute cannot be empty".to_string(),
            ));
        }
        if self.values.is_empty() {
            return Err(Error::Configuration(
                "Discriminator requires at least one value".to_string(),
            ));
        }
        Ok(())
    }

    /// Choose among candidates given each one's attribute value.
    ///
    /// A candidate without the attribute never matches an include value and
    /// is never excluded.
    ///
    /// # Errors
    /// - `Ambiguous` if more than one candidate survives exclusion, or two
    ///   candidates tie on the highest-priority include value
    pub fn choose(&self, candidates: &[(Dn, Option<String>)]) -> Result<Option<Dn>> {
        match self.mode {
            DiscriminatorMode::Exclude => {
                let survivors: Vec<&Dn> = candidates
                    .iter()
                    .filter(|(_, value)| {
                        value.as_ref().is_none_or(|v| !self.values.contains(v))
                    })
                    .map(|(dn, _)| dn)
                    .collect();
                match survivors.as_slice() {
                    [] => Ok(None),
                    [dn] => Ok(Some((*dn).clone())),
                    many => Err(Error::Ambiguous(format!(
                        "{} accounts remain after excluding {:?} on {}",
                        many.len(),
                        self.values,
                        self.attribute
                    ))),
                }
            }
            DiscriminatorMode::Include => {
                for accepted in &self.values {
                    let matching: Vec<&Dn> = candidates
                        .iter()
                        .filter(|(_, value)| value.as_deref() == Some(accepted.as_str()))
                        .map(|(dn, _)| dn)
                        .collect();
                    match matching.as_slice() {
                        [] => continue,
                        [dn] => return Ok(Some((*dn).clone())),
                        many => {
                            return Err(Error::Ambiguous(format!(
                                "{} accounts share {}={}",
                                many.len(),
                                self.attribute,
                                accepted
                            )))
                        }
                    }
                }
                Ok(None)
            }
        }
    }
}

/// Resolution without a discriminator: at most one candidate may exist.
///
/// # Errors
/// - `Ambiguous` if more than one candidate is given
pub fn choose_without_discriminator(candidates: &[Dn]) -> Result<Option<Dn>> {
    match candidates {
        [] => Ok(None),
        [dn] => Ok(Some(dn.clone())),
        many => Err(Error::Ambiguous(format!(
            "{} accounts found and no discriminator configured",
            many.len()
        ))),
    }
}
