//! In-memory remote backend for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use moldap_common::{Error, Result};

use crate::api::RemoteApi;
use crate::model::{Address, Engagement, ItUser, MoObject, ObjectKind, OrgUnit, Person};
use crate::selection::select_current_or_latest;

/// A write observed by [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedWrite {
    Create(MoObject),
    Edit(MoObject),
    Terminate(ObjectKind, Uuid, DateTime<Utc>),
}

/// In-memory remote system.
///
/// Objects are stored as validity slices per UUID. An edit replaces every
/// slice with the new version; a termination closes every open slice.
pub struct MemoryRemote {
    objects: Arc<RwLock<HashMap<Uuid, Vec<MoObject>>>>,
    classes: RwLock<HashMap<String, Vec<Uuid>>>,
    it_systems: RwLock<HashMap<String, Uuid>>,
    writes: Mutex<Vec<RecordedWrite>>,
    reject_next: Mutex<Option<String>>,
    unavailable: AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            classes: RwLock::new(HashMap::new()),
            it_systems: RwLock::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            reject_next: Mutex::new(None),
            unavailable: AtomicBool::new(false),
        }
    }

    fn read_objects(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Vec<MoObject>>> {
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_objects(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Vec<MoObject>>> {
        self.objects.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_writes(&self) -> MutexGuard<'_, Vec<RecordedWrite>> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a slice without recording a write.
    pub fn insert(&self, object: MoObject) {
        self.write_objects().entry(object.uuid()).or_default().push(object);
    }

    pub fn insert_class(&self, user_key: impl Into<String>, uuid: Uuid) {
        self.classes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(user_key.into())
            .or_default()
            .push(uuid);
    }

    pub fn insert_it_system(&self, user_key: impl Into<String>, uuid: Uuid) {
        self.it_systems
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_key.into(), uuid);
    }

    /// Every write received so far, in order.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.lock_writes().clone()
    }

    pub fn clear_writes(&self) {
        self.lock_writes().clear();
    }

    /// Reject the next write with a business rejection.
    pub fn reject_next_write(&self, reason: impl Into<String>) {
        *self.reject_next.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.into());
    }

    /// Make every call fail with a transport error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Transport("Remote system unavailable".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.check_available()?;
        if let Some(reason) = self
            .reject_next
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            return Err(Error::BusinessRejection(reason));
        }
        Ok(())
    }

    /// Current version of every object matching `predicate`.
    fn current_matching(&self, predicate: impl Fn(&MoObject) -> bool) -> Vec<MoObject> {
        let now = Utc::now();
        let objects = self.read_objects();
        let mut found: Vec<MoObject> = objects
            .values()
            .filter_map(|versions| {
                let live: Vec<MoObject> = versions
                    .iter()
                    .filter(|v| v.validity().is_current_at(now))
                    .cloned()
                    .collect();
                select_current_or_latest(live, now).ok()
            })
            .filter(|object| predicate(object))
            .collect();
        found.sort_by_key(MoObject::uuid);
        found
    }

    fn create(&self, object: MoObject) -> Result<Uuid> {
        self.check_write()?;
        let uuid = object.uuid();
        {
            let mut objects = self.write_objects();
            if objects.contains_key(&uuid) {
                return Err(Error::BusinessRejection(format!("Object {} already exists", uuid)));
            }
            objects.insert(uuid, vec![object.clone()]);
        }
        self.lock_writes().push(RecordedWrite::Create(object));
        Ok(uuid)
    }

    fn edit(&self, object: MoObject) -> Result<()> {
        self.check_write()?;
        let uuid = object.uuid();
        {
            let mut objects = self.write_objects();
            let versions = objects
                .get_mut(&uuid)
                .ok_or_else(|| Error::NotFound(format!("Object {} not found", uuid)))?;
            *versions = vec![object.clone()];
        }
        self.lock_writes().push(RecordedWrite::Edit(object));
        Ok(())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn set_end(object: &mut MoObject, at: DateTime<Utc>) {
    let validity = match object {
        MoObject::Person(p) => &mut p.validity,
        MoObject::Address(a) => &mut a.validity,
        MoObject::Engagement(e) => &mut e.validity,
        MoObject::ItUser(i) => &mut i.validity,
        MoObject::OrgUnit(o) => &mut o.validity,
    };
    if validity.to.is_none_or(|end| end > at) {
        validity.to = Some(at);
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn person_versions(&self, uuid: Uuid) -> Result<Vec<Person>> {
        self.check_available()?;
        Ok(self
            .read_objects()
            .get(&uuid)
            .map(|versions| {
                versions
                    .iter()
                    .filter_map(|v| match v {
                        MoObject::Person(p) => Some(p.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn object_versions(&self, kind: ObjectKind, uuid: Uuid) -> Result<Vec<MoObject>> {
        self.check_available()?;
        Ok(self
            .read_objects()
            .get(&uuid)
            .map(|versions| versions.iter().filter(|v| v.kind() == kind).cloned().collect())
            .unwrap_or_default())
    }

    async fn objects_of_person(&self, person: Uuid, kind: ObjectKind) -> Result<Vec<MoObject>> {
        self.check_available()?;
        Ok(self.current_matching(|o| o.kind() == kind && o.person() == Some(person)))
    }

    async fn objects_of_org_unit(&self, unit: Uuid, kind: ObjectKind) -> Result<Vec<MoObject>> {
        self.check_available()?;
        Ok(self.current_matching(|o| o.kind() == kind && o.org_unit() == Some(unit)))
    }

    async fn engagement_slices(&self, person: Uuid) -> Result<Vec<Engagement>> {
        self.check_available()?;
        Ok(self
            .read_objects()
            .values()
            .flatten()
            .filter_map(|v| match v {
                MoObject::Engagement(e) if e.person == person => Some(e.clone()),
                _ => None,
            })
            .collect())
    }

    async fn persons_by_cpr(&self, cpr: &str) -> Result<Vec<Uuid>> {
        self.check_available()?;
        let mut persons: Vec<Uuid> = self
            .read_objects()
            .values()
            .flatten()
            .filter_map(|v| match v {
                MoObject::Person(p) if p.cpr_number.as_deref() == Some(cpr) => Some(p.uuid),
                _ => None,
            })
            .collect();
        persons.sort();
        persons.dedup();
        Ok(persons)
    }

    async fn persons_by_it_user_key(&self, user_key: &str) -> Result<Vec<Uuid>> {
        self.check_available()?;
        let mut persons: Vec<Uuid> = self
            .current_matching(|o| matches!(o, MoObject::ItUser(i) if i.user_key == user_key))
            .iter()
            .filter_map(MoObject::person)
            .collect();
        persons.sort();
        persons.dedup();
        Ok(persons)
    }

    async fn it_system_uuid(&self, user_key: &str) -> Result<Option<Uuid>> {
        self.check_available()?;
        Ok(self
            .it_systems
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_key)
            .copied())
    }

    async fn class_uuid(&self, user_key: &str) -> Result<Option<Uuid>> {
        self.check_available()?;
        let classes = self.classes.read().unwrap_or_else(|e| e.into_inner());
        match classes.get(user_key).map(Vec::as_slice) {
            None | Some([]) => Ok(None),
            Some([uuid]) => Ok(Some(*uuid)),
            Some(_) => Err(Error::Ambiguous(format!(
                "Several classes with user_key '{}'",
                user_key
            ))),
        }
    }

    async fn create_person(&self, person: &Person) -> Result<Uuid> {
        self.create(MoObject::Person(person.clone()))
    }

    async fn edit_person(&self, person: &Person) -> Result<()> {
        self.edit(MoObject::Person(person.clone()))
    }

    async fn create_address(&self, address: &Address) -> Result<Uuid> {
        self.create(MoObject::Address(address.clone()))
    }

    async fn edit_address(&self, address: &Address) -> Result<()> {
        self.edit(MoObject::Address(address.clone()))
    }

    async fn create_engagement(&self, engagement: &Engagement) -> Result<Uuid> {
        self.create(MoObject::Engagement(engagement.clone()))
    }

    async fn edit_engagement(&self, engagement: &Engagement) -> Result<()> {
        self.edit(MoObject::Engagement(engagement.clone()))
    }

    async fn create_it_user(&self, it_user: &ItUser) -> Result<Uuid> {
        self.create(MoObject::ItUser(it_user.clone()))
    }

    async fn edit_it_user(&self, it_user: &ItUser) -> Result<()> {
        self.edit(MoObject::ItUser(it_user.clone()))
    }

    async fn edit_org_unit(&self, unit: &OrgUnit) -> Result<()> {
        self.edit(MoObject::OrgUnit(unit.clone()))
    }

    async fn terminate(&self, kind: ObjectKind, uuid: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.check_write()?;
        {
            let mut objects = self.write_objects();
            let versions = objects
                .get_mut(&uuid)
                .filter(|versions| versions.iter().any(|v| v.kind() == kind))
                .ok_or_else(|| Error::NotFound(format!("{} {} not found", kind, uuid)))?;
            for version in versions.iter_mut() {
                set_end(version, at);
            }
        }
        self.lock_writes().push(RecordedWrite::Terminate(kind, uuid, at));
        Ok(())
    }
}
