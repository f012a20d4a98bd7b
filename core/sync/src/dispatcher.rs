//! Concurrent event processing.
//!
//! Events from both sources run as independent tasks, bounded by a
//! semaphore. Exclusivity per person or DN is enforced inside the
//! orchestrator, so unrelated events never wait on each other. Transport
//! failures are retried here; everything else is final once the
//! orchestrator returns.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use moldap_common::{Error, ErrorKind, Result};
use moldap_directory::DirectoryChange;

use crate::events::{RemoteEvent, SyncEvent};
use crate::orchestrator::{Outcome, SyncOrchestrator};
use crate::retry::{RetryConfig, RetryExecutor};

/// Default bound on events processed at once.
pub const DEFAULT_MAX_CONCURRENT_EVENTS: usize = 10;

/// Runs events against a [`SyncOrchestrator`].
pub struct EventDispatcher {
    orchestrator: Arc<SyncOrchestrator>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    transport_retry: RetryExecutor,
    purge_interval: Duration,
}

impl EventDispatcher {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            transport_retry: RetryExecutor::default(),
            purge_interval: Duration::from_secs(60),
        }
    }

    /// Retry policy for transport failures.
    pub fn with_transport_retry(mut self, config: RetryConfig) -> Self {
        self.transport_retry = RetryExecutor::new(config);
        self
    }

    /// How often expired echo tokens are swept.
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Process one event to completion, retrying transport failures.
    pub async fn process(&self, event: &SyncEvent) -> Result<Outcome> {
        self.transport_retry
            .execute_with_condition(
                || async move {
                    match event {
                        SyncEvent::Remote(e) => self.orchestrator.handle_remote_event(e).await,
                        SyncEvent::Directory(c) => self.orchestrator.handle_directory_event(c).await,
                    }
                },
                Error::is_transport,
            )
            .await
    }

    /// Spawn a task for an event. The task waits for a free slot first.
    pub fn submit(self: &Arc<Self>, event: SyncEvent) -> JoinHandle<()> {
        self.spawn_event(event, None)
    }

    fn spawn_event(self: &Arc<Self>, event: SyncEvent, permit: Option<OwnedSemaphorePermit>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let permit = match permit {
                Some(permit) => permit,
                None => match this.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(event = %event, "Dispatcher stopped, dropping event");
                        return;
                    }
                },
            };
            let result = this.process(&event).await;
            drop(permit);

            match result {
                Ok(Outcome::Cascaded(events)) => {
                    debug!(event = %event, count = events.len(), "Cascading");
                    for cascaded in events {
                        this.submit(SyncEvent::Remote(cascaded));
                    }
                }
                Ok(outcome) => debug!(event = %event, outcome = ?outcome, "Event done"),
                Err(e) => report_failure(&event, &e),
            }
        })
    }

    /// Consume both event sources until `shutdown` flips to true or both
    /// sources close, then wait for in-flight events.
    pub async fn run(
        self: Arc<Self>,
        mut remote_rx: mpsc::Receiver<RemoteEvent>,
        mut directory_rx: mpsc::Receiver<DirectoryChange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(max_concurrent = self.max_concurrent, "Event dispatcher started");
        let mut purge = tokio::time::interval(self.purge_interval);
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut remote_open = true;
        let mut directory_open = true;

        while remote_open || directory_open {
            // Take a slot before pulling so a full dispatcher pushes back on
            // the sources.
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            tokio::select! {
                event = remote_rx.recv(), if remote_open => match event {
                    Some(event) => {
                        self.spawn_event(SyncEvent::Remote(event), Some(permit));
                    }
                    None => {
                        info!("Remote event source closed");
                        remote_open = false;
                    }
                },
                change = directory_rx.recv(), if directory_open => match change {
                    Some(change) => {
                        self.spawn_event(SyncEvent::Directory(change), Some(permit));
                    }
                    None => {
                        info!("Directory event source closed");
                        directory_open = false;
                    }
                },
                _ = purge.tick() => {
                    let purged = self.orchestrator.echo().purge();
                    if purged > 0 {
                        debug!(purged, "Purged expired echo tokens");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Event dispatcher draining");
        self.drain().await;
        info!("Event dispatcher stopped");
    }

    /// Wait until no event holds a slot, then refuse new ones.
    pub async fn drain(&self) {
        let all = u32::try_from(self.max_concurrent).unwrap_or(u32::MAX);
        match self.permits.acquire_many(all).await {
            Ok(_permits) => self.permits.close(),
            Err(_) => debug!("Dispatcher already drained"),
        }
    }
}

/// Log a failed event at the severity its error kind calls for.
pub fn report_failure(event: &SyncEvent, error: &Error) {
    let kind = error.kind();
    match kind {
        ErrorKind::Configuration => {
            error!(event = %event, error_kind = %kind, alert = true, error = %error, "Sync failed on configuration");
        }
        ErrorKind::BusinessRejection | ErrorKind::Ambiguous | ErrorKind::NotFound => {
            warn!(event = %event, error_kind = %kind, error = %error, "Event skipped");
        }
        _ => {
            error!(event = %event, error_kind = %kind, alert = error.needs_alert(), error = %error, "Event failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::TemplateMapper;
    use moldap_common::{Dn, Validity};
    use moldap_directory::{Attributes, DirectoryClient, LdapSettings, MemoryDirectory};
    use moldap_remote::{MemoryRemote, MoObject, ObjectKind, OrgUnit, Person, RemoteClient, Engagement};
    use uuid::Uuid;

    const CPR: &str = "0101011234";

    fn setup() -> (Arc<MemoryDirectory>, Arc<MemoryRemote>, Arc<EventDispatcher>, Uuid, Dn) {
        let directory = Arc::new(MemoryDirectory::new());
        let remote = Arc::new(MemoryRemote::new());
        let person = Uuid::new_v4();
        remote.insert(MoObject::Person(Person {
            uuid: person,
            user_key: None,
            given_name: Some("Anna".to_string()),
            surname: Some("Hansen".to_string()),
            cpr_number: Some(CPR.to_string()),
            nickname_given_name: None,
            nickname_surname: None,
            validity: Validity::unbounded(),
        }));
        let account = Dn::parse("CN=Anna,OU=Users,DC=ad").unwrap();
        directory.insert(account.clone(), Attributes::new().with("employeeID", CPR));

        let mapping = serde_json::from_value(serde_json::json!({
            "Employee": {
                "remote_kind": "person",
                "to_directory": {"sn": "{{ person.surname }}"},
                "from_directory": {"surname": "{{ ldap.sn }}"}
            }
        }))
        .unwrap();
        let mut settings = LdapSettings::for_base("DC=ad");
        settings.cpr_attribute = Some("employeeID".to_string());
        settings.single_valued = vec!["sn".to_string()];

        let remote_client = RemoteClient::new(remote.clone());
        let mapper = TemplateMapper::new(&mapping, remote_client.clone()).unwrap();
        let orchestrator = SyncOrchestrator::new(
            DirectoryClient::new(directory.clone(), settings),
            remote_client,
            Arc::new(mapper),
        );
        let fast = RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        let dispatcher = EventDispatcher::new(Arc::new(orchestrator.with_retry(fast.clone())), 4)
            .with_transport_retry(fast);
        (directory, remote, Arc::new(dispatcher), person, account)
    }

    #[tokio::test]
    async fn test_submit_exports_person() {
        let (directory, _remote, dispatcher, person, account) = setup();
        dispatcher
            .submit(SyncEvent::Remote(RemoteEvent::refresh_person(person)))
            .await
            .unwrap();
        let entry = directory.get(&account).unwrap();
        assert_eq!(entry.attributes.first("sn"), Some("Hansen"));
    }

    #[tokio::test]
    async fn test_transport_failure_retried_then_reported() {
        let (directory, _remote, dispatcher, person, _account) = setup();
        directory.set_unavailable(true);
        let result = dispatcher
            .process(&SyncEvent::Remote(RemoteEvent::refresh_person(person)))
            .await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_cascade_reaches_engaged_persons() {
        let (directory, remote, dispatcher, person, account) = setup();
        let unit = Uuid::new_v4();
        remote.insert(MoObject::OrgUnit(OrgUnit {
            uuid: unit,
            user_key: None,
            name: "IT".to_string(),
            parent: None,
            unit_type: None,
            validity: Validity::unbounded(),
        }));
        remote.insert(MoObject::Engagement(Engagement {
            uuid: Uuid::new_v4(),
            user_key: "1".to_string(),
            org_unit: unit,
            person,
            job_function: Uuid::new_v4(),
            engagement_type: Uuid::new_v4(),
            primary: None,
            is_primary: true,
            extension_1: None,
            extension_2: None,
            extension_3: None,
            validity: Validity::unbounded(),
        }));

        let outcome = dispatcher
            .process(&SyncEvent::Remote(RemoteEvent::new(ObjectKind::OrgUnit, unit)))
            .await
            .unwrap();
        let Outcome::Cascaded(events) = outcome else {
            panic!("expected a cascade");
        };
        for event in events {
            dispatcher.submit(SyncEvent::Remote(event)).await.unwrap();
        }
        assert_eq!(
            directory.get(&account).unwrap().attributes.first("sn"),
            Some("Hansen")
        );
    }

    #[tokio::test]
    async fn test_run_processes_until_sources_close() {
        let (directory, _remote, dispatcher, person, account) = setup();
        let (remote_tx, remote_rx) = mpsc::channel(8);
        let (directory_tx, directory_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let running = tokio::spawn(dispatcher.clone().run(remote_rx, directory_rx, shutdown_rx));
        remote_tx.send(RemoteEvent::refresh_person(person)).await.unwrap();
        drop(remote_tx);
        drop(directory_tx);
        running.await.unwrap();

        assert_eq!(
            directory.get(&account).unwrap().attributes.first("sn"),
            Some("Hansen")
        );
        // Drained dispatchers refuse further work.
        dispatcher
            .submit(SyncEvent::Remote(RemoteEvent::refresh_person(person)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let (_directory, _remote, dispatcher, _person, _account) = setup();
        let (_remote_tx, remote_rx) = mpsc::channel::<RemoteEvent>(8);
        let (_directory_tx, directory_rx) = mpsc::channel::<DirectoryChange>(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let running = tokio::spawn(dispatcher.clone().run(remote_rx, directory_rx, shutdown_rx));
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
    }
}
