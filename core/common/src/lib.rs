//! Common utilities and types shared across the MO/LDAP synchronization crates.
//!
//! This module provides the error taxonomy every component reports through,
//! plus the small value types (distinguished names, validity windows, kind
//! tags, secrets) that cross crate boundaries.

pub mod error;
pub mod types;
pub mod validity;

pub use error::{Error, ErrorKind, Result};
pub use types::{Dn, Kind, Secret};
pub use validity::Validity;
