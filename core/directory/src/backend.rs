//! Directory backend trait definition.

use async_trait::async_trait;

use moldap_common::{Dn, Result};

use crate::attributes::{Attributes, DirectoryEntry};
use crate::filter::Filter;

/// Search scope relative to the base DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Only the base entry itself.
    Base,
    /// The base entry and everything below it.
    Subtree,
}

/// A search against the directory.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base: Dn,
    pub scope: SearchScope,
    pub filter: Filter,
    /// Attributes to return; empty or `*` means all.
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn subtree(base: Dn, filter: Filter, attributes: Vec<String>) -> Self {
        Self {
            base,
            scope: SearchScope::Subtree,
            filter,
            attributes,
        }
    }

    pub fn base(dn: Dn, attributes: Vec<String>) -> Self {
        Self {
            base: dn,
            scope: SearchScope::Base,
            filter: Filter::present("objectClass"),
            attributes,
        }
    }
}

/// A single attribute modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    /// Add values to a (multi-valued) attribute.
    Add(String, Vec<String>),
    /// Replace all values; an empty list clears the attribute.
    Replace(String, Vec<String>),
    /// Delete the listed values; an empty list deletes the attribute.
    Delete(String, Vec<String>),
}

impl Modification {
    pub fn attribute(&self) -> &str {
        match self {
            Modification::Add(name, _)
            | Modification::Replace(name, _)
            | Modification::Delete(name, _) => name,
        }
    }
}

/// Directory backend.
///
/// Implementations are stateless per call and safe to share between tasks.
/// A search whose base does not exist yields no entries rather than an error.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Backend name (e.g. "ldap", "memory").
    fn name(&self) -> &str;

    /// Run a search and return the matching entries only (no referrals).
    ///
    /// # Errors
    /// - Transport errors talking to the server
    async fn search(&self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>>;

    /// Apply modifications to an existing entry.
    ///
    /// # Errors
    /// - `NotFound` if the entry does not exist
    /// - `BusinessRejection` if the server refuses the values
    /// - Transport errors
    async fn modify(&self, dn: &Dn, changes: Vec<Modification>) -> Result<()>;

    /// Create an entry with the given object class and initial attributes.
    ///
    /// # Errors
    /// - `BusinessRejection` if the entry exists or violates the schema
    /// - Transport errors
    async fn add(&self, dn: &Dn, object_class: &str, attributes: &Attributes) -> Result<()>;
}
