//! High-level directory operations shared by the poller and the orchestrator.

use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use moldap_common::{Dn, Error, Result};

use crate::attributes::{Attributes, DirectoryEntry};
use crate::backend::{Directory, Modification, SearchRequest};
use crate::config::LdapSettings;
use crate::discriminator::choose_without_discriminator;
use crate::filter::Filter;

/// Directory client.
///
/// Wraps a [`Directory`] backend with the settings that give its results
/// meaning: search base, unique-id attribute, single-valued attributes and
/// the discriminator.
#[derive(Clone)]
pub struct DirectoryClient {
    backend: Arc<dyn Directory>,
    settings: Arc<LdapSettings>,
}

/// Modifications computed against an entry's current state, not yet sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    dn: Dn,
    object_class: String,
    changes: Vec<Modification>,
    create: bool,
}

impl PendingWrite {
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn changes(&self) -> &[Modification] {
        &self.changes
    }

    /// Whether the entry already holds the desired values.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl DirectoryClient {
    pub fn new(backend: Arc<dyn Directory>, settings: LdapSettings) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &LdapSettings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn Directory> {
        &self.backend
    }

    pub fn unique_id_attribute(&self) -> &str {
        &self.settings.unique_id_attribute
    }

    pub fn is_single_valued(&self, attribute: &str) -> bool {
        self.settings.is_single_valued(attribute)
    }

    /// Subtree search below `base` (default: the configured search base).
    pub async fn search(
        &self,
        filter: Filter,
        base: Option<&Dn>,
        attributes: &[String],
    ) -> Result<Vec<DirectoryEntry>> {
        let base = match base {
            Some(base) => base.clone(),
            None => self.settings.search_base()?,
        };
        let request = SearchRequest::subtree(base, filter, attributes.to_vec());
        self.backend.search(&request).await
    }

    /// Search expecting exactly one entry.
    ///
    /// # Errors
    /// - `NotFound` on zero matches
    /// - `Ambiguous` on more than one
    pub async fn resolve_unique(
        &self,
        filter: Filter,
        attributes: &[String],
    ) -> Result<DirectoryEntry> {
        let rendered = filter.to_ldap_string();
        let mut entries = self.search(filter, None, attributes).await?;
        match entries.len() {
            0 => Err(Error::NotFound(format!("No entry matches {}", rendered))),
            1 => Ok(entries.remove(0)),
            n => Err(Error::Ambiguous(format!("{} entries match {}", n, rendered))),
        }
    }

    /// Read a single entry by DN.
    ///
    /// # Errors
    /// - `NotFound` if the entry does not exist
    pub async fn read(&self, dn: &Dn, attributes: &[String]) -> Result<DirectoryEntry> {
        let request = SearchRequest::base(dn.clone(), attributes.to_vec());
        self.backend
            .search(&request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("No such object: {}", dn)))
    }

    /// DN of the entry carrying the given unique id, if any.
    pub async fn find_by_unique_id(&self, unique_id: Uuid) -> Result<Option<Dn>> {
        let filter = Filter::equals(self.unique_id_attribute(), unique_id.to_string());
        let attributes = vec![self.unique_id_attribute().to_string()];
        match self.resolve_unique(filter, &attributes).await {
            Ok(entry) => Ok(Some(entry.dn)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// DNs of every entry whose `attribute` equals `value`.
    pub async fn dns_by_attribute(&self, attribute: &str, value: &str) -> Result<Vec<Dn>> {
        let entries = self
            .search(Filter::equals(attribute, value), None, &[attribute.to_string()])
            .await?;
        Ok(entries.into_iter().map(|e| e.dn).collect())
    }

    /// DNs carrying the given personal correlation id, when a cpr attribute
    /// is configured.
    pub async fn dns_by_cpr(&self, cpr: &str) -> Result<Vec<Dn>> {
        match &self.settings.cpr_attribute {
            Some(attribute) => self.dns_by_attribute(attribute, cpr).await,
            None => Ok(Vec::new()),
        }
    }

    /// Pick one DN among candidates believed to be the same logical account.
    ///
    /// # Errors
    /// - `Ambiguous` when the candidates cannot be narrowed to one
    /// - `TransientInconsistency` when a candidate vanished while being read
    pub async fn apply_discriminator(&self, candidates: &[Dn]) -> Result<Option<Dn>> {
        let mut unique: Vec<Dn> = Vec::new();
        for dn in candidates {
            if !unique.contains(dn) {
                unique.push(dn.clone());
            }
        }

        let Some(discriminator) = &self.settings.discriminator else {
            return choose_without_discriminator(&unique);
        };
        if unique.is_empty() {
            return Ok(None);
        }

        let attribute = vec![discriminator.attribute.clone()];
        let reads = unique.iter().map(|dn| {
            let attribute = &attribute;
            async move {
                match self.read(dn, attribute).await {
                    Ok(entry) => Ok((
                        dn.clone(),
                        entry.attributes.first(&discriminator.attribute).map(str::to_string),
                    )),
                    Err(Error::NotFound(_)) => Err(Error::TransientInconsistency(format!(
                        "Discriminator candidate {} disappeared",
                        dn
                    ))),
                    Err(e) => Err(e),
                }
            }
        });
        let values = try_join_all(reads).await?;
        let chosen = discriminator.choose(&values)?;
        debug!(candidates = values.len(), chosen = ?chosen.as_ref().map(Dn::as_str), "Applied discriminator");
        Ok(chosen)
    }

    /// Work out the modifications that bring an entry to `attributes`.
    ///
    /// Single-valued attributes, or all of them when `overwrite` is set, are
    /// replaced unless they already hold exactly the desired values; the rest
    /// get only their missing values added, since servers refuse to add a
    /// value twice. The DN pseudo-attribute is never written.
    pub async fn prepare(
        &self,
        dn: &Dn,
        object_class: &str,
        attributes: &Attributes,
        overwrite: bool,
    ) -> Result<PendingWrite> {
        let names: Vec<String> = attributes
            .names()
            .filter(|name| !name.eq_ignore_ascii_case("dn"))
            .map(str::to_string)
            .collect();
        let current = if names.is_empty() {
            None
        } else {
            match self.read(dn, &names).await {
                Ok(entry) => Some(entry.attributes),
                Err(Error::NotFound(_)) => None,
                Err(e) => return Err(e),
            }
        };
        let create = current.is_none() && !names.is_empty();
        let changes = self.modifications_for(current.as_ref(), attributes, overwrite);
        Ok(PendingWrite {
            dn: dn.clone(),
            object_class: object_class.to_string(),
            changes,
            create,
        })
    }

    /// Issue a prepared write, creating the entry first when it was missing.
    pub async fn commit(&self, write: &PendingWrite) -> Result<()> {
        if write.changes.is_empty() {
            return Ok(());
        }
        if write.create {
            warn!(dn = %write.dn, object_class = %write.object_class, "Entry missing, creating it");
            if let Err(e) = self
                .backend
                .add(&write.dn, &write.object_class, &Attributes::new())
                .await
            {
                // Created concurrently; the modification still applies.
                let raced = matches!(e, Error::BusinessRejection(_)) && self.exists(&write.dn).await?;
                if !raced {
                    return Err(e);
                }
            }
        }
        self.backend.modify(&write.dn, write.changes.clone()).await
    }

    /// Prepare and commit in one step. Returns whether anything was written.
    pub async fn apply(
        &self,
        dn: &Dn,
        object_class: &str,
        attributes: &Attributes,
        overwrite: bool,
    ) -> Result<bool> {
        let write = self.prepare(dn, object_class, attributes, overwrite).await?;
        if write.is_empty() {
            return Ok(false);
        }
        self.commit(&write).await?;
        Ok(true)
    }

    async fn exists(&self, dn: &Dn) -> Result<bool> {
        match self.read(dn, &["objectClass".to_string()]).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn modifications_for(
        &self,
        current: Option<&Attributes>,
        attributes: &Attributes,
        overwrite: bool,
    ) -> Vec<Modification> {
        let mut changes = Vec::new();
        for (name, value) in attributes.iter() {
            if name.eq_ignore_ascii_case("dn") {
                continue;
            }
            let mut values: Vec<String> = Vec::new();
            for v in value.to_vec() {
                if !v.is_empty() && !values.contains(&v) {
                    values.push(v);
                }
            }
            let existing: Vec<&str> = current.map(|a| a.all(name)).unwrap_or_default();

            if overwrite || self.is_single_valued(name) {
                let unchanged = existing.len() == values.len()
                    && values.iter().all(|v| existing.contains(&v.as_str()));
                if !unchanged {
                    changes.push(Modification::Replace(name.to_string(), values));
                }
            } else {
                let missing: Vec<String> = values
                    .into_iter()
                    .filter(|v| !existing.contains(&v.as_str()))
                    .collect();
                if !missing.is_empty() {
                    changes.push(Modification::Add(name.to_string(), missing));
                }
            }
        }
        changes
    }

    /// Remove specific values of an attribute.
    pub async fn delete_values(&self, dn: &Dn, attribute: &str, values: Vec<String>) -> Result<()> {
        self.backend
            .modify(dn, vec![Modification::Delete(attribute.to_string(), values)])
            .await
    }
}
