//! Remote system backend trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use moldap_common::Result;

use crate::model::{Address, Engagement, ItUser, MoObject, ObjectKind, OrgUnit, Person};

/// Typed access to the remote HR system.
///
/// Reads return raw validity slices or current objects; choosing among
/// slices is the caller's job (see [`crate::selection`]). Every write kind
/// has its own call so a backend never has to inspect payload types.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Backend name (e.g. "graphql", "memory").
    fn name(&self) -> &str;

    /// All validity slices of a person; empty if the person does not exist.
    async fn person_versions(&self, uuid: Uuid) -> Result<Vec<Person>>;

    /// All validity slices of an object of the given kind.
    async fn object_versions(&self, kind: ObjectKind, uuid: Uuid) -> Result<Vec<MoObject>>;

    /// Currently valid objects of `kind` attached to a person.
    async fn objects_of_person(&self, person: Uuid, kind: ObjectKind) -> Result<Vec<MoObject>>;

    /// Currently valid objects of `kind` attached to an org unit.
    async fn objects_of_org_unit(&self, unit: Uuid, kind: ObjectKind) -> Result<Vec<MoObject>>;

    /// Every engagement slice of a person, past, present and future.
    async fn engagement_slices(&self, person: Uuid) -> Result<Vec<Engagement>>;

    /// Persons carrying the given personal correlation id.
    async fn persons_by_cpr(&self, cpr: &str) -> Result<Vec<Uuid>>;

    /// Persons owning a current IT user with the given user key.
    async fn persons_by_it_user_key(&self, user_key: &str) -> Result<Vec<Uuid>>;

    /// UUID of the IT system with the given user key.
    async fn it_system_uuid(&self, user_key: &str) -> Result<Option<Uuid>>;

    /// UUID of the class with the given user key.
    ///
    /// # Errors
    /// - `Ambiguous` if several classes share the user key
    async fn class_uuid(&self, user_key: &str) -> Result<Option<Uuid>>;

    async fn create_person(&self, person: &Person) -> Result<Uuid>;
    async fn edit_person(&self, person: &Person) -> Result<()>;

    async fn create_address(&self, address: &Address) -> Result<Uuid>;
    async fn edit_address(&self, address: &Address) -> Result<()>;

    async fn create_engagement(&self, engagement: &Engagement) -> Result<Uuid>;
    async fn edit_engagement(&self, engagement: &Engagement) -> Result<()>;

    async fn create_it_user(&self, it_user: &ItUser) -> Result<Uuid>;
    async fn edit_it_user(&self, it_user: &ItUser) -> Result<()>;

    async fn edit_org_unit(&self, unit: &OrgUnit) -> Result<()>;

    /// End an object's validity at `at`.
    ///
    /// # Errors
    /// - `NotFound` if the object does not exist
    /// - `BusinessRejection` if the remote refuses the date
    async fn terminate(&self, kind: ObjectKind, uuid: Uuid, at: DateTime<Utc>) -> Result<()>;
}
