//! Keys that scope exclusivity and echo suppression.

use std::fmt;
use uuid::Uuid;

use moldap_common::Dn;

/// The identity an operation is serialized on.
///
/// Directory-to-remote work is keyed by DN, remote-to-directory work by
/// person. Writes to the remote system are remembered per object, since the
/// remote notifies per object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncKey {
    Dn(Dn),
    Person(Uuid),
    Object(Uuid),
}

impl SyncKey {
    /// Stable string form; DNs compare case- and whitespace-insensitively.
    pub fn as_key(&self) -> String {
        match self {
            SyncKey::Dn(dn) => format!("dn:{}", dn.normalized()),
            SyncKey::Person(uuid) => format!("person:{}", uuid),
            SyncKey::Object(uuid) => format!("object:{}", uuid),
        }
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncKey::Dn(dn) => write!(f, "{}", dn),
            SyncKey::Person(uuid) | SyncKey::Object(uuid) => write!(f, "{}", uuid),
        }
    }
}
