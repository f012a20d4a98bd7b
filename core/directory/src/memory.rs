//! In-memory directory backend for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use moldap_common::{Dn, Error, Result};

use crate::attributes::{AttributeValue, Attributes, DirectoryEntry};
use crate::backend::{Directory, Modification, SearchRequest, SearchScope};
use crate::filter::ldap_timestamp;

const MODIFY_TIMESTAMP: &str = "modifyTimestamp";

/// In-memory directory.
///
/// Entries are keyed by normalized DN and carry a `modifyTimestamp` that
/// every write bumps, so the poller can be exercised against it. All data
/// is lost on drop.
pub struct MemoryDirectory {
    entries: Arc<RwLock<HashMap<String, DirectoryEntry>>>,
    writes: Arc<RwLock<Vec<(Dn, Vec<Modification>)>>>,
    unavailable: AtomicBool,
}

impl MemoryDirectory {
    /// Create a new empty directory.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            writes: Arc::new(RwLock::new(Vec::new())),
            unavailable: AtomicBool::new(false),
        }
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, DirectoryEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<String, DirectoryEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Transport("Directory unavailable".to_string()));
        }
        Ok(())
    }

    /// Insert or overwrite an entry, stamped with the current time.
    pub fn insert(&self, dn: Dn, attributes: Attributes) {
        self.insert_at(dn, attributes, Utc::now());
    }

    /// Insert or overwrite an entry with an explicit modification time.
    pub fn insert_at(&self, dn: Dn, mut attributes: Attributes, at: DateTime<Utc>) {
        if !attributes.contains("objectClass") {
            attributes.set("objectClass", "top");
        }
        attributes.set(MODIFY_TIMESTAMP, ldap_timestamp(at));
        self.write_entries()
            .insert(dn.normalized(), DirectoryEntry::new(dn, attributes));
    }

    /// Set the modification time of an existing entry.
    pub fn touch(&self, dn: &Dn, at: DateTime<Utc>) -> bool {
        match self.write_entries().get_mut(&dn.normalized()) {
            Some(entry) => {
                entry.attributes.set(MODIFY_TIMESTAMP, ldap_timestamp(at));
                true
            }
            None => false,
        }
    }

    /// Remove an entry.
    pub fn remove(&self, dn: &Dn) -> Option<DirectoryEntry> {
        self.write_entries().remove(&dn.normalized())
    }

    /// Snapshot of a single entry.
    pub fn get(&self, dn: &Dn) -> Option<DirectoryEntry> {
        self.read_entries().get(&dn.normalized()).cloned()
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// Every modification applied so far, in order.
    pub fn modifications(&self) -> Vec<(Dn, Vec<Modification>)> {
        self.writes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Make every call fail with a transport error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply one modification. Adding a value the attribute already holds is
/// refused with `attributeOrValueExists` semantics.
fn apply_modification(attributes: &mut Attributes, change: &Modification) -> Result<()> {
    match change {
        Modification::Add(name, values) => {
            let mut current: Vec<String> = attributes
                .get(name)
                .map(AttributeValue::to_vec)
                .unwrap_or_default();
            for value in values {
                if current.contains(value) {
                    return Err(Error::BusinessRejection(format!(
                        "Attribute or value exists: {}={}",
                        name, value
                    )));
                }
                current.push(value.clone());
            }
            attributes.set(name.as_str(), AttributeValue::from_values(current));
        }
        Modification::Replace(name, values) => {
            if values.is_empty() {
                attributes.remove(name);
            } else {
                attributes.set(name.as_str(), AttributeValue::from_values(values.clone()));
            }
        }
        Modification::Delete(name, values) => {
            if values.is_empty() {
                attributes.remove(name);
                return Ok(());
            }
            let remaining: Vec<String> = attributes
                .get(name)
                .map(AttributeValue::to_vec)
                .unwrap_or_default()
                .into_iter()
                .filter(|v| !values.contains(v))
                .collect();
            if remaining.is_empty() {
                attributes.remove(name);
            } else {
                attributes.set(name.as_str(), AttributeValue::from_values(remaining));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Directory for MemoryDirectory {
    fn name(&self) -> &str {
        "memory"
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>> {
        self.check_available()?;
        let entries = self.read_entries();
        let mut found: Vec<DirectoryEntry> = entries
            .values()
            .filter(|entry| match request.scope {
                SearchScope::Base => entry.dn == request.base,
                SearchScope::Subtree => entry.dn.is_within(&request.base),
            })
            .filter(|entry| request.filter.matches(&entry.attributes))
            .map(|entry| {
                DirectoryEntry::new(entry.dn.clone(), entry.attributes.project(&request.attributes))
            })
            .collect();
        found.sort_by_key(|entry| entry.dn.normalized());
        Ok(found)
    }

    async fn modify(&self, dn: &Dn, changes: Vec<Modification>) -> Result<()> {
        self.check_available()?;
        {
            let mut entries = self.write_entries();
            let entry = entries
                .get_mut(&dn.normalized())
                .ok_or_else(|| Error::NotFound(format!("No such object: {}", dn)))?;
            // All or nothing, like a server-side modify.
            let mut updated = entry.attributes.clone();
            for change in &changes {
                apply_modification(&mut updated, change)?;
            }
            updated.set(MODIFY_TIMESTAMP, ldap_timestamp(Utc::now()));
            entry.attributes = updated;
        }
        self.writes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((dn.clone(), changes));
        Ok(())
    }

    async fn add(&self, dn: &Dn, object_class: &str, attributes: &Attributes) -> Result<()> {
        self.check_available()?;
        let mut entries = self.write_entries();
        if entries.contains_key(&dn.normalized()) {
            return Err(Error::BusinessRejection(format!("Entry already exists: {}", dn)));
        }
        let mut attributes = attributes.clone();
        attributes.set("objectClass", object_class);
        attributes.set(MODIFY_TIMESTAMP, ldap_timestamp(Utc::now()));
        entries.insert(dn.normalized(), DirectoryEntry::new(dn.clone(), attributes));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_subtree_search_with_filter() {
        let directory = MemoryDirectory::new();
        directory.insert(dn("CN=a,OU=Users,DC=x"), Attributes::new().with("title", "Boss"));
        directory.insert(dn("CN=b,OU=Users,DC=x"), Attributes::new().with("title", "Clerk"));
        directory.insert(dn("CN=c,OU=Other,DC=x"), Attributes::new().with("title", "Boss"));

        let request = SearchRequest::subtree(
            dn("OU=Users,DC=x"),
            Filter::equals("title", "boss"),
            vec!["title".into()],
        );
        let found = directory.search(&request).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].dn, dn("cn=a,ou=users,dc=x"));
        assert_eq!(found[0].attributes.len(), 1);
    }

    #[tokio::test]
    async fn test_search_missing_base_is_empty() {
        let directory = MemoryDirectory::new();
        let request = SearchRequest::base(dn("CN=nobody,DC=x"), vec![]);
        assert!(directory.search(&request).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_modify_semantics() {
        let directory = MemoryDirectory::new();
        let target = dn("CN=a,DC=x");
        directory.insert(target.clone(), Attributes::new().with("mobile", "1"));

        directory
            .modify(
                &target,
                vec![
                    Modification::Add("mobile".into(), vec!["2".into()]),
                    Modification::Replace("title".into(), vec!["Boss".into()]),
                ],
            )
            .await
            .unwrap();
        let entry = directory.get(&target).unwrap();
        assert_eq!(entry.attributes.all("mobile"), vec!["1", "2"]);
        assert_eq!(entry.attributes.first("title"), Some("Boss"));

        directory
            .modify(&target, vec![Modification::Delete("mobile".into(), vec!["1".into()])])
            .await
            .unwrap();
        let entry = directory.get(&target).unwrap();
        assert_eq!(entry.attributes.all("mobile"), vec!["2"]);
        assert_eq!(directory.modifications().len(), 2);
    }

    #[tokio::test]
    async fn test_add_existing_value_rejected_atomically() {
        let directory = MemoryDirectory::new();
        let target = dn("CN=a,DC=x");
        directory.insert(target.clone(), Attributes::new().with("mail", "a@x.dk"));

        let result = directory
            .modify(
                &target,
                vec![
                    Modification::Replace("title".into(), vec!["Boss".into()]),
                    Modification::Add("mail".into(), vec!["a@x.dk".into()]),
                ],
            )
            .await;
        assert!(matches!(result, Err(Error::BusinessRejection(_))));
        let entry = directory.get(&target).unwrap();
        assert!(!entry.attributes.contains("title"));
        assert_eq!(entry.attributes.all("mail"), vec!["a@x.dk"]);
        assert!(directory.modifications().is_empty());
    }

    #[tokio::test]
    async fn test_modify_missing_entry() {
        let directory = MemoryDirectory::new();
        let result = directory
            .modify(&dn("CN=ghost,DC=x"), vec![Modification::Replace("a".into(), vec![])])
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_add_twice_rejected() {
        let directory = MemoryDirectory::new();
        let target = dn("CN=new,DC=x");
        directory.add(&target, "user", &Attributes::new()).await.unwrap();
        assert!(matches!(
            directory.add(&target, "user", &Attributes::new()).await,
            Err(Error::BusinessRejection(_))
        ));
        let entry = directory.get(&target).unwrap();
        assert_eq!(entry.attributes.first("objectClass"), Some("user"));
    }

    #[tokio::test]
    async fn test_unavailable_is_transport_error() {
        let directory = MemoryDirectory::new();
        directory.set_unavailable(true);
        let request = SearchRequest::base(dn("CN=a,DC=x"), vec![]);
        let err = directory.search(&request).await.unwrap_err();
        assert!(err.is_transport());
    }
}
