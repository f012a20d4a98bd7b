//! The synchronization state machine.
//!
//! Every event moves through the same states:
//! `Received -> EchoCheck -> ExclusivityAcquired -> DiscriminatorResolved
//! -> Loaded -> Converted -> Reconciled -> Written -> CleanupEvaluated
//! -> CascadeRefreshed -> Done`.
//!
//! Remote events are serialized per person and exported to the directory;
//! directory events are serialized per DN and imported into the remote
//! system. Each attempt re-resolves current state from both systems, so a
//! rerun after a transient failure starts from scratch.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use moldap_common::{Dn, Error, ErrorKind, Kind, Result};
use moldap_directory::{AttributeValue, Attributes, DirectoryChange, DirectoryClient, DirectoryEntry};
use moldap_remote::{MoObject, ObjectKind, Person, RemoteClient};

use crate::echo::EchoRegistry;
use crate::events::RemoteEvent;
use crate::exclusivity::KeyedLocks;
use crate::key::SyncKey;
use crate::mapping::{matches_selector, selector_uuid, KindMapping, Mapper, MappingContext, DN_ATTRIBUTE};
use crate::reconcile::{reconcile, Decision};
use crate::retry::{RetryConfig, RetryExecutor};

/// Terminal state of one processed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Processed; `writes` counts the write calls made.
    Completed { writes: usize },
    /// The event reported our own earlier write.
    EchoDropped,
    /// The entity vanished between notification and processing.
    LoadMiss,
    /// Nothing to do for this event.
    Skipped(String),
    /// Dependent entities must be refreshed.
    Cascaded(Vec<RemoteEvent>),
}

enum Owner {
    Person(Uuid),
    OrgUnit(Uuid),
    Gone,
}

/// Whether a value must survive cleanup because more than one mapped
/// attribute of the entry holds it.
pub fn shared_values_guard(attributes: &Attributes, mapped_attributes: &[String], value: &str) -> bool {
    mapped_attributes
        .iter()
        .filter(|name| attributes.all(name).contains(&value))
        .count()
        > 1
}

/// Synchronization orchestrator.
pub struct SyncOrchestrator {
    directory: DirectoryClient,
    remote: RemoteClient,
    mapper: Arc<dyn Mapper>,
    echo: Arc<EchoRegistry>,
    locks: KeyedLocks,
    retry: RetryExecutor,
    /// User key of the IT system whose user keys are directory unique ids.
    it_system: Option<String>,
}

impl SyncOrchestrator {
    pub fn new(directory: DirectoryClient, remote: RemoteClient, mapper: Arc<dyn Mapper>) -> Self {
        Self {
            directory,
            remote,
            mapper,
            echo: Arc::new(EchoRegistry::default()),
            locks: KeyedLocks::new(),
            retry: RetryExecutor::default(),
            it_system: None,
        }
    }

    pub fn with_echo_registry(mut self, echo: Arc<EchoRegistry>) -> Self {
        self.echo = echo;
        self
    }

    /// Retry policy for transient inconsistencies.
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryExecutor::new(config);
        self
    }

    pub fn with_it_system(mut self, user_key: impl Into<String>) -> Self {
        self.it_system = Some(user_key.into());
        self
    }

    pub fn echo(&self) -> &Arc<EchoRegistry> {
        &self.echo
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    pub fn directory(&self) -> &DirectoryClient {
        &self.directory
    }

    pub fn remote(&self) -> &RemoteClient {
        &self.remote
    }

    /// Export a remote change to the directory.
    ///
    /// # Errors
    /// - `Configuration` for mapping bugs (never retried)
    /// - `TransientInconsistency` once the retry budget is spent
    /// - `Transport` for the caller's retry policy
    pub async fn handle_remote_event(&self, event: &RemoteEvent) -> Result<Outcome> {
        debug!(event = %event, "Received remote event");
        if self.echo.check(&SyncKey::Object(event.entity_uuid)) {
            info!(key = %event.entity_uuid, kind = %event.kind, "Dropping echo of own write");
            return Ok(Outcome::EchoDropped);
        }

        match self.owner_of(event).await? {
            Owner::Person(person) => {
                let _guard = self.locks.acquire(&SyncKey::Person(person)).await;
                self.retry
                    .execute(|| self.export_person(person, event.kind))
                    .await
            }
            Owner::OrgUnit(unit) => self.cascade(unit).await,
            Owner::Gone => {
                info!(key = %event.entity_uuid, kind = %event.kind, "Object no longer exists");
                Ok(Outcome::LoadMiss)
            }
        }
    }

    /// Import a directory change into the remote system.
    ///
    /// # Errors
    /// - `Configuration` for mapping bugs (never retried)
    /// - `Ambiguous` when the account correlates to several persons
    /// - `TransientInconsistency` once the retry budget is spent
    /// - `Transport` for the caller's retry policy
    pub async fn handle_directory_event(&self, change: &DirectoryChange) -> Result<Outcome> {
        debug!(dn = %change.dn, "Received directory event");
        let key = SyncKey::Dn(change.dn.clone());
        if self.echo.check(&key) {
            info!(key = %change.dn, "Dropping echo of own write");
            return Ok(Outcome::EchoDropped);
        }

        let _guard = self.locks.acquire(&key).await;
        self.retry.execute(|| self.import_account(change)).await
    }

    async fn owner_of(&self, event: &RemoteEvent) -> Result<Owner> {
        match event.kind {
            ObjectKind::Person => return Ok(Owner::Person(event.entity_uuid)),
            ObjectKind::OrgUnit => return Ok(Owner::OrgUnit(event.entity_uuid)),
            _ => {}
        }
        if let Some(object) = self.remote.load_object(event.kind, event.entity_uuid).await? {
            if let Some(person) = object.person() {
                return Ok(Owner::Person(person));
            }
            if let Some(unit) = object.org_unit() {
                return Ok(Owner::OrgUnit(unit));
            }
        }
        // A deleted object may still have left values in the directory.
        let Some(parent) = event.parent_uuid else {
            return Ok(Owner::Gone);
        };
        if self.remote.load_person(parent).await?.is_some() {
            return Ok(Owner::Person(parent));
        }
        if self
            .remote
            .load_object(ObjectKind::OrgUnit, parent)
            .await?
            .is_some()
        {
            return Ok(Owner::OrgUnit(parent));
        }
        Ok(Owner::Gone)
    }

    async fn cascade(&self, unit: Uuid) -> Result<Outcome> {
        let persons = self.remote.persons_engaged_in(unit).await?;
        info!(unit = %unit, persons = persons.len(), "Refreshing persons engaged in org unit");
        Ok(Outcome::Cascaded(
            persons.into_iter().map(RemoteEvent::refresh_person).collect(),
        ))
    }

    /// Kinds a remote change of `trigger` can affect in the directory.
    fn export_kinds(&self, trigger: ObjectKind) -> Vec<Kind> {
        self.mapper
            .kinds()
            .into_iter()
            .filter(|kind| {
                self.mapper.rules(kind).is_some_and(|rules| {
                    rules.export_to_directory
                        && match trigger {
                            ObjectKind::Person => true,
                            // Person attributes are derived from the primary engagement too.
                            ObjectKind::Engagement => matches!(
                                rules.remote_kind,
                                ObjectKind::Person | ObjectKind::Engagement
                            ),
                            other => rules.remote_kind == other,
                        }
                })
            })
            .collect()
    }

    /// Kinds imported from the directory, persons first.
    fn import_kinds(&self) -> Vec<(Kind, KindMapping)> {
        let mut kinds: Vec<(Kind, KindMapping)> = self
            .mapper
            .kinds()
            .into_iter()
            .filter_map(|kind| {
                let rules = self.mapper.rules(&kind)?.clone();
                rules.import_to_remote.then_some((kind, rules))
            })
            .collect();
        kinds.sort_by_key(|(kind, rules)| (rules.remote_kind != ObjectKind::Person, kind.clone()));
        kinds
    }

    async fn directory_it_system(&self) -> Result<Option<Uuid>> {
        let Some(user_key) = &self.it_system else {
            return Ok(None);
        };
        self.remote
            .api()
            .it_system_uuid(user_key)
            .await?
            .map(Some)
            .ok_or_else(|| Error::Configuration(format!("Unknown IT system '{}'", user_key)))
    }

    /// Directory accounts correlated with a person, by IT user and by cpr.
    async fn accounts_of_person(&self, person: &Person) -> Result<Vec<Dn>> {
        let mut dns = Vec::new();
        if let Some(system) = self.directory_it_system().await? {
            for object in self
                .remote
                .objects_of_person(person.uuid, ObjectKind::ItUser)
                .await?
            {
                let MoObject::ItUser(it_user) = object else {
                    continue;
                };
                if it_user.itsystem != system {
                    continue;
                }
                if let Ok(unique_id) = Uuid::parse_str(&it_user.user_key) {
                    if let Some(dn) = self.directory.find_by_unique_id(unique_id).await? {
                        dns.push(dn);
                    }
                }
            }
        }
        if let Some(cpr) = &person.cpr_number {
            dns.extend(self.directory.dns_by_cpr(cpr).await?);
        }
        Ok(dns)
    }

    /// The account that receives an engagement's attributes: the one whose
    /// unique id is the user key of an IT user bound to that engagement.
    async fn correlate_engagement(&self, person: Uuid, engagement: Uuid) -> Result<Option<Dn>> {
        let Some(system) = self.directory_it_system().await? else {
            return Ok(None);
        };
        for object in self
            .remote
            .objects_of_person(person, ObjectKind::ItUser)
            .await?
        {
            let MoObject::ItUser(it_user) = object else {
                continue;
            };
            if it_user.itsystem != system || it_user.engagement != Some(engagement) {
                continue;
            }
            if let Ok(unique_id) = Uuid::parse_str(&it_user.user_key) {
                if let Some(dn) = self.directory.find_by_unique_id(unique_id).await? {
                    return Ok(Some(dn));
                }
            }
        }
        Ok(None)
    }

    /// The person a directory account belongs to.
    ///
    /// # Errors
    /// - `Ambiguous` when several persons claim the account
    async fn person_of_account(&self, entry: &DirectoryEntry) -> Result<Option<Uuid>> {
        let mut persons = Vec::new();
        if let Some(unique_id) = unique_id_in(entry, self.directory.unique_id_attribute()) {
            persons = self
                .remote
                .api()
                .persons_by_it_user_key(&unique_id.to_string())
                .await?;
        }
        if persons.is_empty() {
            let cpr = self
                .directory
                .settings()
                .cpr_attribute
                .as_deref()
                .and_then(|attribute| entry.attributes.first(attribute));
            if let Some(cpr) = cpr {
                persons = self.remote.api().persons_by_cpr(cpr).await?;
            }
        }
        persons.sort();
        persons.dedup();
        match persons.as_slice() {
            [] => Ok(None),
            [person] => Ok(Some(*person)),
            many => Err(Error::Ambiguous(format!(
                "{} persons correlate with {}",
                many.len(),
                entry.dn
            ))),
        }
    }

    async fn export_person(&self, person: Uuid, trigger: ObjectKind) -> Result<Outcome> {
        let Some(person_object) = self.remote.load_person(person).await? else {
            info!(key = %person, "Person no longer exists");
            return Ok(Outcome::LoadMiss);
        };
        let kinds = self.export_kinds(trigger);
        if kinds.is_empty() {
            return Ok(Outcome::Skipped(format!("No export mapping for {}", trigger)));
        }

        let engagement = self.remote.primary_engagement(person).await?;
        let accounts = self.accounts_of_person(&person_object).await?;
        let account = self.directory.apply_discriminator(&accounts).await?;

        let mut context = MappingContext::new();
        context.insert("person", &person_object)?;
        context.insert("person_uuid", &person)?;
        if let Some(engagement) = &engagement {
            context.insert("engagement", engagement)?;
        }

        let mut announced = HashSet::new();
        let mut writes = 0;
        for kind in kinds {
            let Some(rules) = self.mapper.rules(&kind).cloned() else {
                continue;
            };
            let target = match (rules.remote_kind, &engagement) {
                (ObjectKind::Engagement, None) => {
                    debug!(key = %person, kind = %kind, "No primary engagement to export");
                    continue;
                }
                (ObjectKind::Engagement, Some(e)) => self
                    .correlate_engagement(person, e.uuid)
                    .await?
                    .or_else(|| account.clone()),
                _ => account.clone(),
            };
            let has_dn_template = rules
                .to_directory
                .keys()
                .any(|name| name.eq_ignore_ascii_case(DN_ATTRIBUTE));
            if target.is_none() && !has_dn_template {
                debug!(key = %person, kind = %kind, "No directory account");
                continue;
            }

            let mut kind_context = match &target {
                Some(dn) => context.clone().with_dn(dn),
                None => context.clone(),
            };
            let attributes = match (rules.remote_kind, &engagement) {
                (ObjectKind::Address | ObjectKind::ItUser, _) => {
                    let selector = selector_uuid(&self.remote, &rules).await?;
                    let objects: Vec<MoObject> = self
                        .remote
                        .objects_of_person(person, rules.remote_kind)
                        .await?
                        .into_iter()
                        .filter(|object| matches_selector(object, selector))
                        .collect();
                    self.render_objects(&kind, &kind_context, &objects).await?
                }
                (ObjectKind::Engagement, Some(e)) => {
                    kind_context.insert("object", e)?;
                    self.mapper.to_directory(&kind, &kind_context).await?
                }
                _ => self.mapper.to_directory(&kind, &kind_context).await?,
            };

            let rendered_dn = attributes.first(DN_ATTRIBUTE).unwrap_or_default();
            let dn = Dn::parse(rendered_dn).map_err(|e| {
                Error::Configuration(format!("Kind {} rendered an invalid dn: {}", kind, e))
            })?;
            writes += self
                .write_directory(&kind, &rules, &dn, &attributes, &mut announced)
                .await?;
        }
        Ok(Outcome::Completed { writes })
    }

    /// Render a multi-object kind once per object and merge the values.
    async fn render_objects(
        &self,
        kind: &Kind,
        context: &MappingContext,
        objects: &[MoObject],
    ) -> Result<Attributes> {
        if objects.is_empty() {
            return self.mapper.to_directory(kind, context).await;
        }
        let mut merged = Attributes::new();
        for object in objects {
            let mut object_context = context.clone();
            object_context.insert("object", object)?;
            let rendered = self.mapper.to_directory(kind, &object_context).await?;
            for (name, value) in rendered.iter() {
                if name.eq_ignore_ascii_case(DN_ATTRIBUTE) {
                    if !merged.contains(DN_ATTRIBUTE) {
                        merged.set(DN_ATTRIBUTE, value.clone());
                    }
                    continue;
                }
                let mut values = merged.get(name).map(AttributeValue::to_vec).unwrap_or_default();
                for v in value.to_vec() {
                    if !values.contains(&v) {
                        values.push(v);
                    }
                }
                merged.set(name, AttributeValue::from_values(values));
            }
        }
        Ok(merged)
    }

    async fn write_directory(
        &self,
        kind: &Kind,
        rules: &KindMapping,
        dn: &Dn,
        attributes: &Attributes,
        announced: &mut HashSet<String>,
    ) -> Result<usize> {
        let pending = self
            .directory
            .prepare(dn, &rules.object_class, attributes, rules.overwrite)
            .await?;
        let mut writes = 0;
        if pending.is_empty() {
            debug!(key = %dn, kind = %kind, "Directory already up to date");
        } else {
            let registered = self.announce(dn, announced);
            if let Err(e) = self.directory.commit(&pending).await {
                self.withdraw(dn, announced, registered);
                return Err(e);
            }
            info!(key = %dn, kind = %kind, changes = pending.changes().len(), "Wrote directory attributes");
            writes += 1;
        }

        if !rules.overwrite && matches!(rules.remote_kind, ObjectKind::Address | ObjectKind::ItUser) {
            writes += self.cleanup(dn, attributes, announced).await?;
        }
        Ok(writes)
    }

    /// Register an echo token for `dn` unless this event already did.
    /// One token per DN per event: the poller reports a DN once per cycle.
    fn announce(&self, dn: &Dn, announced: &mut HashSet<String>) -> bool {
        let first = announced.insert(dn.normalized());
        if first {
            self.echo.register(&SyncKey::Dn(dn.clone()));
        }
        first
    }

    fn withdraw(&self, dn: &Dn, announced: &mut HashSet<String>, registered: bool) {
        if registered {
            self.echo.discard(&SyncKey::Dn(dn.clone()));
            announced.remove(&dn.normalized());
        }
    }

    /// Delete values the remote system no longer has, unless another mapped
    /// attribute still holds them.
    async fn cleanup(
        &self,
        dn: &Dn,
        attributes: &Attributes,
        announced: &mut HashSet<String>,
    ) -> Result<usize> {
        let mapped = self.mapper.mapped_attributes();
        let entry = match self.directory.read(dn, &mapped).await {
            Ok(entry) => entry,
            // Nothing written and nothing to clean.
            Err(Error::NotFound(_)) => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut deletions = 0;
        for (name, desired) in attributes.iter() {
            if name.eq_ignore_ascii_case(DN_ATTRIBUTE) || self.directory.is_single_valued(name) {
                continue;
            }
            let wanted = desired.to_vec();
            let stale: Vec<String> = entry
                .attributes
                .all(name)
                .into_iter()
                .filter(|value| !wanted.iter().any(|w| w == value))
                .filter(|value| {
                    let shared = shared_values_guard(&entry.attributes, &mapped, value);
                    if shared {
                        debug!(key = %dn, attribute = %name, value = %value, "Keeping value shared with another attribute");
                    }
                    !shared
                })
                .map(str::to_string)
                .collect();
            if stale.is_empty() {
                continue;
            }
            info!(key = %dn, attribute = %name, count = stale.len(), "Removing stale values");
            let registered = self.announce(dn, announced);
            if let Err(e) = self.directory.delete_values(dn, name, stale).await {
                self.withdraw(dn, announced, registered);
                return Err(e);
            }
            deletions += 1;
        }
        Ok(deletions)
    }

    async fn import_account(&self, change: &DirectoryChange) -> Result<Outcome> {
        let dn = match change.unique_id {
            Some(unique_id) => match self.directory.find_by_unique_id(unique_id).await? {
                Some(dn) => dn,
                None => {
                    info!(key = %change.dn, "Entry no longer exists");
                    return Ok(Outcome::LoadMiss);
                }
            },
            None => change.dn.clone(),
        };
        let requested = vec![
            "*".to_string(),
            self.directory.unique_id_attribute().to_string(),
        ];
        let entry = match self.directory.read(&dn, &requested).await {
            Ok(entry) => entry,
            Err(Error::NotFound(_)) => {
                info!(key = %dn, "Entry no longer exists");
                return Ok(Outcome::LoadMiss);
            }
            Err(e) => return Err(e),
        };

        let kinds = self.import_kinds();
        if kinds.is_empty() {
            return Ok(Outcome::Skipped("No import mapping".to_string()));
        }

        let person = match self.person_of_account(&entry).await? {
            Some(uuid) => self.remote.load_person(uuid).await?,
            None => None,
        };
        match &person {
            Some(person) => {
                let mut candidates = self.accounts_of_person(person).await?;
                candidates.push(dn.clone());
                match self.directory.apply_discriminator(&candidates).await? {
                    Some(chosen) if chosen == dn => {}
                    chosen => {
                        info!(
                            key = %dn,
                            chosen = ?chosen.as_ref().map(Dn::as_str),
                            "Not the authoritative account for its person"
                        );
                        return Ok(Outcome::Skipped("Not the authoritative account".to_string()));
                    }
                }
            }
            None => {
                let creates_person = kinds
                    .iter()
                    .any(|(_, rules)| rules.remote_kind == ObjectKind::Person);
                if !creates_person {
                    info!(key = %dn, "No person correlates with account");
                    return Ok(Outcome::Skipped("No person".to_string()));
                }
            }
        }

        let person_uuid = person.as_ref().map(|p| p.uuid).unwrap_or_else(Uuid::new_v4);
        let engagement = match &person {
            Some(_) => self.remote.primary_engagement(person_uuid).await?,
            None => None,
        };
        let mut context = MappingContext::new().with_dn(&dn);
        context.insert("person_uuid", &person_uuid)?;
        if let Some(person) = &person {
            context.insert("person", person)?;
        }
        if let Some(engagement) = &engagement {
            context.insert("engagement", engagement)?;
        }

        let mut writes = 0;
        for (kind, rules) in kinds {
            let candidates = self.mapper.from_directory(&kind, &entry, &context).await?;
            if candidates.is_empty() {
                continue;
            }
            let existing = match &person {
                None => Vec::new(),
                Some(person) if rules.remote_kind == ObjectKind::Person => {
                    vec![MoObject::Person(person.clone())]
                }
                Some(_) => {
                    let selector = selector_uuid(&self.remote, &rules).await?;
                    self.remote
                        .objects_of_person(person_uuid, rules.remote_kind)
                        .await?
                        .into_iter()
                        .filter(|object| matches_selector(object, selector))
                        .collect()
                }
            };
            for decision in reconcile(&candidates, &existing)? {
                writes += self.write_remote(&kind, &decision).await?;
            }
        }
        Ok(Outcome::Completed { writes })
    }

    async fn write_remote(&self, kind: &Kind, decision: &Decision) -> Result<usize> {
        let Some(request) = decision.to_request() else {
            if let Decision::Skip { uuid, reason } = decision {
                debug!(kind = %kind, uuid = ?uuid, reason = ?reason, "Skipping candidate");
            }
            return Ok(0);
        };
        let key = SyncKey::Object(request.object.uuid());
        self.echo.register(&key);
        match self.remote.dispatch(&request).await {
            Ok(uuid) => {
                info!(kind = %kind, uuid = %uuid, verb = ?request.verb, "Wrote remote object");
                Ok(1)
            }
            Err(Error::BusinessRejection(reason)) => {
                self.echo.discard(&key);
                warn!(
                    kind = %kind,
                    key = %request.object.uuid(),
                    error_kind = %ErrorKind::BusinessRejection,
                    reason = %reason,
                    "Remote rejected write, skipping"
                );
                Ok(0)
            }
            Err(e) => {
                self.echo.discard(&key);
                Err(e)
            }
        }
    }
}

fn unique_id_in(entry: &DirectoryEntry, attribute: &str) -> Option<Uuid> {
    entry
        .attributes
        .first(attribute)
        .and_then(|raw| Uuid::parse_str(raw.trim_matches(|c| c == '{' || c == '}')).ok())
}
