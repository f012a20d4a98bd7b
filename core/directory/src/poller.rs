//! Change polling by modification timestamp.
//!
//! Each poller owns one search base. A cycle computes "now" first, searches
//! for entries modified since the stored cursor, emits one change per
//! entry, and only then stores the cycle-start time as the new cursor.
//! Windows therefore overlap by the duration of a cycle and never leave a
//! gap; consumers must tolerate duplicates.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use moldap_common::{Dn, Error, Result};

use crate::client::DirectoryClient;
use crate::cursor::CursorStore;
use crate::filter::Filter;

/// A directory entry observed as changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirectoryChange {
    /// The entry's unique id, when present and parsable.
    pub unique_id: Option<Uuid>,
    pub dn: Dn,
}

impl DirectoryChange {
    /// Key used to collapse duplicates within one cycle.
    fn dedup_key(&self) -> String {
        match self.unique_id {
            Some(id) => id.to_string(),
            None => self.dn.normalized(),
        }
    }
}

/// Poller for a single search base.
pub struct Poller {
    client: DirectoryClient,
    base: Dn,
    store: Arc<dyn CursorStore>,
    sender: mpsc::Sender<DirectoryChange>,
}

impl Poller {
    pub fn new(
        client: DirectoryClient,
        base: Dn,
        store: Arc<dyn CursorStore>,
        sender: mpsc::Sender<DirectoryChange>,
    ) -> Self {
        Self {
            client,
            base,
            store,
            sender,
        }
    }

    pub fn base(&self) -> &Dn {
        &self.base
    }

    fn cursor_key(&self) -> String {
        self.base.normalized()
    }

    /// Run one cycle at the current wall-clock time.
    pub async fn poll_once(&self) -> Result<Vec<DirectoryChange>> {
        self.poll_at(Utc::now()).await
    }

    /// Run one cycle as if the clock read `now`.
    ///
    /// The stored cursor becomes `max(now, previous cursor)`, so a clock
    /// stepping backwards never moves it back. Without a previous cursor the
    /// window starts at `now`.
    pub async fn poll_at(&self, now: DateTime<Utc>) -> Result<Vec<DirectoryChange>> {
        let key = self.cursor_key();
        let last = self.store.load(&key).await?;
        let since = last.unwrap_or(now);
        let cycle_start = now.max(since);

        debug!(base = %self.base, since = %since, "Searching for changes");

        let unique_id_attribute = self.client.unique_id_attribute().to_string();
        let entries = self
            .client
            .search(
                Filter::modified_since(since),
                Some(&self.base),
                std::slice::from_ref(&unique_id_attribute),
            )
            .await?;

        let mut seen = HashSet::new();
        let mut changes = Vec::new();
        for entry in entries {
            let unique_id = entry
                .attributes
                .first(&unique_id_attribute)
                .and_then(|raw| Uuid::parse_str(raw.trim_matches(|c| c == '{' || c == '}')).ok());
            if unique_id.is_none() {
                warn!(dn = %entry.dn, "Changed entry without unique id");
            }
            let change = DirectoryChange {
                unique_id,
                dn: entry.dn,
            };
            if seen.insert(change.dedup_key()) {
                changes.push(change);
            }
        }

        for change in &changes {
            if self.sender.send(change.clone()).await.is_err() {
                return Err(Error::Transport("Change receiver closed".to_string()));
            }
        }

        self.store.store(&key, cycle_start).await?;
        if !changes.is_empty() {
            info!(base = %self.base, count = changes.len(), "Emitted directory changes");
        }
        Ok(changes)
    }

    /// Poll every `interval` until `shutdown` flips to true.
    ///
    /// A failed cycle leaves the cursor untouched and is retried on the next
    /// tick; a closed receiver ends the loop.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(base = %self.base, "Poller started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(_) => {}
                        Err(e) if self.sender.is_closed() => {
                            info!(base = %self.base, error = %e, "Change receiver closed, stopping poller");
                            break;
                        }
                        Err(e) => {
                            error!(base = %self.base, error = %e, error_kind = %e.kind(), "Poll cycle failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(base = %self.base, "Poller stopped");
    }
}

/// One running poller per configured search base.
pub struct PollerSet {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl PollerSet {
    /// Spawn a poller task for every poll base in the client's settings.
    pub fn spawn(
        client: DirectoryClient,
        store: Arc<dyn CursorStore>,
        sender: mpsc::Sender<DirectoryChange>,
        interval: Duration,
    ) -> Result<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        for base in client.settings().poll_bases()? {
            let poller = Poller::new(client.clone(), base, store.clone(), sender.clone());
            handles.push(tokio::spawn(poller.run(interval, shutdown_rx.clone())));
        }
        Ok(Self { handles, shutdown })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Healthy while every poller task is still running.
    pub fn is_healthy(&self) -> bool {
        self.handles.iter().all(|h| !h.is_finished())
    }

    /// Signal every poller to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Poller task ended abnormally");
            }
        }
    }
}
