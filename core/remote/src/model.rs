//! Remote (HR) object model.
//!
//! Field names follow the remote system's mutation inputs; the aliases
//! accept the `*_uuid` spelling its read queries return.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use moldap_common::Validity;

/// A person, owned by the remote system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub uuid: Uuid,
    #[serde(default)]
    pub user_key: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub surname: Option<String>,
    /// Personal correlation id.
    #[serde(default)]
    pub cpr_number: Option<String>,
    #[serde(default)]
    pub nickname_given_name: Option<String>,
    #[serde(default)]
    pub nickname_surname: Option<String>,
    #[serde(default)]
    pub validity: Validity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub uuid: Uuid,
    #[serde(default)]
    pub user_key: Option<String>,
    pub value: String,
    #[serde(alias = "address_type_uuid")]
    pub address_type: Uuid,
    #[serde(default, alias = "employee_uuid")]
    pub person: Option<Uuid>,
    #[serde(default, alias = "org_unit_uuid")]
    pub org_unit: Option<Uuid>,
    #[serde(default, alias = "engagement_uuid")]
    pub engagement: Option<Uuid>,
    #[serde(default, alias = "visibility_uuid")]
    pub visibility: Option<Uuid>,
    #[serde(default)]
    pub validity: Validity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engagement {
    pub uuid: Uuid,
    pub user_key: String,
    #[serde(alias = "org_unit_uuid")]
    pub org_unit: Uuid,
    #[serde(alias = "employee_uuid")]
    pub person: Uuid,
    #[serde(alias = "job_function_uuid")]
    pub job_function: Uuid,
    #[serde(alias = "engagement_type_uuid")]
    pub engagement_type: Uuid,
    #[serde(default, alias = "primary_uuid")]
    pub primary: Option<Uuid>,
    /// Computed by the remote system from `primary`; read-only.
    #[serde(default, skip_serializing)]
    pub is_primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_3: Option<String>,
    #[serde(default)]
    pub validity: Validity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItUser {
    pub uuid: Uuid,
    pub user_key: String,
    #[serde(alias = "itsystem_uuid")]
    pub itsystem: Uuid,
    #[serde(default, alias = "employee_uuid")]
    pub person: Option<Uuid>,
    #[serde(default, alias = "org_unit_uuid")]
    pub org_unit: Option<Uuid>,
    #[serde(default, alias = "engagement_uuid")]
    pub engagement: Option<Uuid>,
    #[serde(default)]
    pub validity: Validity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgUnit {
    pub uuid: Uuid,
    #[serde(default)]
    pub user_key: Option<String>,
    pub name: String,
    #[serde(default, alias = "parent_uuid")]
    pub parent: Option<Uuid>,
    #[serde(default, alias = "unit_type_uuid")]
    pub unit_type: Option<Uuid>,
    #[serde(default)]
    pub validity: Validity,
}

/// The finite set of remote object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Person,
    Address,
    Engagement,
    ItUser,
    OrgUnit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Person => "person",
            ObjectKind::Address => "address",
            ObjectKind::Engagement => "engagement",
            ObjectKind::ItUser => "ituser",
            ObjectKind::OrgUnit => "org_unit",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote object of any kind, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MoObject {
    Person(Person),
    Address(Address),
    Engagement(Engagement),
    ItUser(ItUser),
    OrgUnit(OrgUnit),
}

impl MoObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            MoObject::Person(_) => ObjectKind::Person,
            MoObject::Address(_) => ObjectKind::Address,
            MoObject::Engagement(_) => ObjectKind::Engagement,
            MoObject::ItUser(_) => ObjectKind::ItUser,
            MoObject::OrgUnit(_) => ObjectKind::OrgUnit,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            MoObject::Person(p) => p.uuid,
            MoObject::Address(a) => a.uuid,
            MoObject::Engagement(e) => e.uuid,
            MoObject::ItUser(i) => i.uuid,
            MoObject::OrgUnit(o) => o.uuid,
        }
    }

    pub fn validity(&self) -> Validity {
        match self {
            MoObject::Person(p) => p.validity,
            MoObject::Address(a) => a.validity,
            MoObject::Engagement(e) => e.validity,
            MoObject::ItUser(i) => i.validity,
            MoObject::OrgUnit(o) => o.validity,
        }
    }

    /// The person this object belongs to, if any.
    pub fn person(&self) -> Option<Uuid> {
        match self {
            MoObject::Person(p) => Some(p.uuid),
            MoObject::Address(a) => a.person,
            MoObject::Engagement(e) => Some(e.person),
            MoObject::ItUser(i) => i.person,
            MoObject::OrgUnit(_) => None,
        }
    }

    /// The org unit this object belongs to, if any.
    pub fn org_unit(&self) -> Option<Uuid> {
        match self {
            MoObject::Person(_) => None,
            MoObject::Address(a) => a.org_unit,
            MoObject::Engagement(e) => Some(e.org_unit),
            MoObject::ItUser(i) => i.org_unit,
            MoObject::OrgUnit(o) => Some(o.uuid),
        }
    }
}

/// Anything carrying a validity window.
pub trait HasValidity {
    fn validity(&self) -> Validity;
}

macro_rules! impl_has_validity {
    ($($ty:ty),*) => {
        $(impl HasValidity for $ty {
            fn validity(&self) -> Validity {
                self.validity
            }
        })*
    };
}

impl_has_validity!(Person, Address, Engagement, ItUser, OrgUnit);

impl HasValidity for Validity {
    fn validity(&self) -> Validity {
        *self
    }
}

impl HasValidity for MoObject {
    fn validity(&self) -> Validity {
        MoObject::validity(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_roundtrip_kind() {
        let json = serde_json::json!({
            "type": "address",
            "uuid": Uuid::nil(),
            "value": "jane@example.org",
            "address_type": Uuid::nil(),
            "person": Uuid::nil(),
            "validity": {"from": "2021-01-01T00:00:00Z", "to": null}
        });
        let object: MoObject = serde_json::from_value(json).unwrap();
        assert_eq!(object.kind(), ObjectKind::Address);
        assert_eq!(object.person(), Some(Uuid::nil()));
    }

    #[test]
    fn test_read_aliases() {
        let json = serde_json::json!({
            "uuid": Uuid::nil(),
            "user_key": "1234",
            "org_unit_uuid": Uuid::nil(),
            "employee_uuid": Uuid::nil(),
            "job_function_uuid": Uuid::nil(),
            "engagement_type_uuid": Uuid::nil(),
            "is_primary": true,
            "validity": {"from": null, "to": null}
        });
        let engagement: Engagement = serde_json::from_value(json).unwrap();
        assert!(engagement.is_primary);
        let written = serde_json::to_value(&engagement).unwrap();
        assert!(written.get("is_primary").is_none());
        assert!(written.get("org_unit").is_some());
    }
}
