//! Inbound events.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use moldap_directory::DirectoryChange;
use moldap_remote::ObjectKind;

/// Change notification from the remote system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub kind: ObjectKind,
    pub entity_uuid: Uuid,
    /// The owning person or org unit, when the notifier knows it.
    #[serde(default)]
    pub parent_uuid: Option<Uuid>,
}

impl RemoteEvent {
    pub fn new(kind: ObjectKind, entity_uuid: Uuid) -> Self {
        Self {
            kind,
            entity_uuid,
            parent_uuid: None,
        }
    }

    /// Re-derive everything the directory shows for a person.
    pub fn refresh_person(person: Uuid) -> Self {
        Self::new(ObjectKind::Person, person)
    }
}

impl fmt::Display for RemoteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.entity_uuid)
    }
}

/// Any event the engine processes.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Remote(RemoteEvent),
    Directory(DirectoryChange),
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::Remote(event) => write!(f, "remote {}", event),
            SyncEvent::Directory(change) => write!(f, "directory {}", change.dn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_notification_line() {
        let event: RemoteEvent = serde_json::from_str(
            r#"{"kind":"address","entity_uuid":"8b1d5a0e-1f6c-4b8e-9d5f-2c3b4a5d6e7f","parent_uuid":"1b1d5a0e-1f6c-4b8e-9d5f-2c3b4a5d6e7f"}"#,
        )
        .unwrap();
        assert_eq!(event.kind, ObjectKind::Address);
        assert!(event.parent_uuid.is_some());

        let bare: RemoteEvent =
            serde_json::from_str(r#"{"kind":"org_unit","entity_uuid":"8b1d5a0e-1f6c-4b8e-9d5f-2c3b4a5d6e7f"}"#)
                .unwrap();
        assert_eq!(bare.parent_uuid, None);
    }
}
