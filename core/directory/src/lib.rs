//! Directory access for the MO/LDAP synchronization engine.
//!
//! This crate provides a trait-based interface over the LDAP-style directory
//! (an `ldap3` backend and an in-memory backend), and on top of it:
//! - a client with paged search, unique resolution and attribute writes
//! - discriminator resolution, picking one account among several candidates
//! - a change poller that turns modification timestamps into events
//!
//! # Design Principles
//! - Backend isolation: no ldap3 types leak past the `ldap` module
//! - Case-insensitive attribute names, hidden behind [`Attributes`]
//! - Every read is a fresh snapshot; nothing is cached between attempts

pub mod attributes;
pub mod backend;
pub mod client;
pub mod config;
pub mod cursor;
pub mod discriminator;
pub mod filter;
pub mod ldap;
pub mod memory;
pub mod poller;

pub use attributes::{AttributeValue, Attributes, DirectoryEntry};
pub use backend::{Directory, Modification, SearchRequest, SearchScope};
pub use client::{DirectoryClient, PendingWrite};
pub use config::{LdapSettings, ServerSettings};
pub use cursor::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use discriminator::{Discriminator, DiscriminatorMode};
pub use filter::{ldap_timestamp, Filter};
pub use ldap::LdapDirectory;
pub use memory::MemoryDirectory;
pub use poller::{DirectoryChange, Poller, PollerSet};
