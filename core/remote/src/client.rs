//! Remote client: slice selection on top of a backend, plus write dispatch.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use moldap_common::{Error, Result};

use crate::api::RemoteApi;
use crate::model::{Engagement, MoObject, ObjectKind, Person};
use crate::selection::{resolve_primary, select_current_or_latest};

/// Whether a write creates a new object or edits an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Edit,
}

/// A write to be dispatched to the remote system.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub verb: Verb,
    pub object: MoObject,
    /// When set, the object is terminated at this date instead of written.
    pub terminate_at: Option<DateTime<Utc>>,
}

impl WriteRequest {
    pub fn create(object: MoObject) -> Self {
        Self {
            verb: Verb::Create,
            object,
            terminate_at: None,
        }
    }

    pub fn edit(object: MoObject) -> Self {
        Self {
            verb: Verb::Edit,
            object,
            terminate_at: None,
        }
    }

    pub fn terminate(object: MoObject, at: DateTime<Utc>) -> Self {
        Self {
            verb: Verb::Edit,
            object,
            terminate_at: Some(at),
        }
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Remote client.
#[derive(Clone)]
pub struct RemoteClient {
    api: Arc<dyn RemoteApi>,
    clock: Clock,
}

impl RemoteClient {
    pub fn new(api: Arc<dyn RemoteApi>) -> Self {
        Self {
            api,
            clock: Arc::new(Utc::now),
        }
    }

    /// Use a fixed notion of "now", for tests.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn api(&self) -> &Arc<dyn RemoteApi> {
        &self.api
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// The current (or latest) version of a person; `None` if unknown.
    pub async fn load_person(&self, uuid: Uuid) -> Result<Option<Person>> {
        let versions = self.api.person_versions(uuid).await?;
        if versions.is_empty() {
            return Ok(None);
        }
        select_current_or_latest(versions, self.now()).map(Some)
    }

    /// The current (or latest) version of an object; `None` if unknown.
    pub async fn load_object(&self, kind: ObjectKind, uuid: Uuid) -> Result<Option<MoObject>> {
        let versions = self.api.object_versions(kind, uuid).await?;
        if versions.is_empty() {
            return Ok(None);
        }
        select_current_or_latest(versions, self.now()).map(Some)
    }

    /// Current objects of a kind attached to a person.
    pub async fn objects_of_person(&self, person: Uuid, kind: ObjectKind) -> Result<Vec<MoObject>> {
        self.api.objects_of_person(person, kind).await
    }

    /// The person's primary engagement; `None` if the person has none at all.
    ///
    /// # Errors
    /// - `TransientInconsistency` while the remote primary computation has
    ///   not converged
    pub async fn primary_engagement(&self, person: Uuid) -> Result<Option<Engagement>> {
        let slices = self.api.engagement_slices(person).await?;
        resolve_primary(slices, self.now())
    }

    /// Persons with a current engagement in the given unit.
    pub async fn persons_engaged_in(&self, unit: Uuid) -> Result<Vec<Uuid>> {
        let engagements = self
            .api
            .objects_of_org_unit(unit, ObjectKind::Engagement)
            .await?;
        let mut persons: Vec<Uuid> = engagements.iter().filter_map(MoObject::person).collect();
        persons.sort();
        persons.dedup();
        Ok(persons)
    }

    /// Send a write to the call owned by the object's kind.
    ///
    /// Returns the UUID of the affected object.
    ///
    /// # Errors
    /// - `InvalidInput` for a create that is also flagged for termination
    /// - `Configuration` for a kind that cannot be created from here
    /// - Whatever the backend reports
    pub async fn dispatch(&self, request: &WriteRequest) -> Result<Uuid> {
        let kind = request.object.kind();
        let uuid = request.object.uuid();
        match (request.verb, request.terminate_at) {
            (Verb::Create, Some(_)) => Err(Error::InvalidInput(format!(
                "Refusing to terminate {} {} that does not exist yet",
                kind, uuid
            ))),
            (Verb::Edit, Some(at)) => {
                info!(kind = %kind, uuid = %uuid, at = %at, "Terminating remote object");
                self.api.terminate(kind, uuid, at).await?;
                Ok(uuid)
            }
            (Verb::Create, None) => {
                debug!(kind = %kind, uuid = %uuid, "Creating remote object");
                match &request.object {
                    MoObject::Person(p) => self.api.create_person(p).await,
                    MoObject::Address(a) => self.api.create_address(a).await,
                    MoObject::Engagement(e) => self.api.create_engagement(e).await,
                    MoObject::ItUser(i) => self.api.create_it_user(i).await,
                    MoObject::OrgUnit(_) => Err(Error::Configuration(
                        "Org units cannot be created from the directory".to_string(),
                    )),
                }
            }
            (Verb::Edit, None) => {
                debug!(kind = %kind, uuid = %uuid, "Editing remote object");
                match &request.object {
                    MoObject::Person(p) => self.api.edit_person(p).await?,
                    MoObject::Address(a) => self.api.edit_address(a).await?,
                    MoObject::Engagement(e) => self.api.edit_engagement(e).await?,
                    MoObject::ItUser(i) => self.api.edit_it_user(i).await?,
                    MoObject::OrgUnit(o) => self.api.edit_org_unit(o).await?,
                }
                Ok(uuid)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRemote, RecordedWrite};
    use crate::model::Address;
    use chrono::TimeZone;
    use moldap_common::Validity;

    fn address(person: Uuid) -> Address {
        Address {
            uuid: Uuid::new_v4(),
            user_key: None,
            value: "jane@example.org".to_string(),
            address_type: Uuid::nil(),
            person: Some(person),
            org_unit: None,
            engagement: None,
            visibility: None,
            validity: Validity::open_from(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_kind() {
        let remote = Arc::new(MemoryRemote::new());
        let client = RemoteClient::new(remote.clone());
        let object = MoObject::Address(address(Uuid::new_v4()));

        let uuid = client.dispatch(&WriteRequest::create(object.clone())).await.unwrap();
        assert_eq!(uuid, object.uuid());
        client.dispatch(&WriteRequest::edit(object.clone())).await.unwrap();

        let writes = remote.writes();
        assert!(matches!(writes[0], RecordedWrite::Create(_)));
        assert!(matches!(writes[1], RecordedWrite::Edit(_)));
    }

    #[tokio::test]
    async fn test_create_with_termination_rejected() {
        let remote = Arc::new(MemoryRemote::new());
        let client = RemoteClient::new(remote.clone());
        let mut request = WriteRequest::create(MoObject::Address(address(Uuid::new_v4())));
        request.terminate_at = Some(Utc::now());

        let result = client.dispatch(&request).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(remote.writes().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_ends_validity() {
        let remote = Arc::new(MemoryRemote::new());
        let object = MoObject::Address(address(Uuid::new_v4()));
        remote.insert(object.clone());
        let client = RemoteClient::new(remote.clone());
        let end = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

        client
            .dispatch(&WriteRequest::terminate(object.clone(), end))
            .await
            .unwrap();
        let loaded = client
            .load_object(ObjectKind::Address, object.uuid())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.validity().to, Some(end));
    }

    #[tokio::test]
    async fn test_load_missing_person_is_none() {
        let client = RemoteClient::new(Arc::new(MemoryRemote::new()));
        assert!(client.load_person(Uuid::new_v4()).await.unwrap().is_none());
    }
}
