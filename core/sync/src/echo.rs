//! Echo suppression.
//!
//! After writing to one system we expect to hear about our own write again
//! through that system's notifications. [`EchoRegistry`] remembers such
//! writes for a bounded time so the echo can be recognized and dropped.
//! Best effort: an unrelated change arriving inside the window is dropped
//! too, and an echo arriving after it is processed again (harmlessly, since
//! processing is idempotent).

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::key::SyncKey;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Default lifetime of an ignore token.
pub const DEFAULT_ECHO_TTL_SECS: i64 = 60;

/// Registry of pending ignore tokens, one timestamp per write.
pub struct EchoRegistry {
    ttl: Duration,
    clock: Clock,
    entries: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl EchoRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            clock: Arc::new(Utc::now),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Use an injected clock, for tests.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<DateTime<Utc>>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one pending echo for `key`. Call before the write is issued.
    pub fn register(&self, key: &SyncKey) {
        let now = (self.clock)();
        debug!(key = %key, "Registering echo token");
        self.lock().entry(key.as_key()).or_default().push_back(now);
    }

    /// Consume the oldest live token for `key`.
    ///
    /// Returns `true` when the event for `key` is an echo and should be
    /// dropped.
    pub fn check(&self, key: &SyncKey) -> bool {
        let cutoff = (self.clock)() - self.ttl;
        let name = key.as_key();
        let mut entries = self.lock();
        let Some(tokens) = entries.get_mut(&name) else {
            return false;
        };
        while tokens.front().is_some_and(|at| *at <= cutoff) {
            tokens.pop_front();
        }
        let hit = tokens.pop_front().is_some();
        if tokens.is_empty() {
            entries.remove(&name);
        }
        hit
    }

    /// Withdraw the newest token for `key`, when the write it announced was
    /// never made.
    pub fn discard(&self, key: &SyncKey) {
        let name = key.as_key();
        let mut entries = self.lock();
        if let Some(tokens) = entries.get_mut(&name) {
            tokens.pop_back();
            if tokens.is_empty() {
                entries.remove(&name);
            }
        }
    }

    /// Drop every expired token. Returns the number of tokens removed.
    pub fn purge(&self) -> usize {
        let cutoff = (self.clock)() - self.ttl;
        let mut removed = 0;
        let mut entries = self.lock();
        entries.retain(|_, tokens| {
            let before = tokens.len();
            tokens.retain(|at| *at > cutoff);
            removed += before - tokens.len();
            !tokens.is_empty()
        });
        removed
    }

    /// Number of pending tokens, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EchoRegistry {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_ECHO_TTL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use moldap_common::Dn;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use uuid::Uuid;

    fn registry_with_clock() -> (Arc<AtomicI64>, EchoRegistry) {
        let offset = Arc::new(AtomicI64::new(0));
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let handle = offset.clone();
        let registry = EchoRegistry::default()
            .with_clock(move || base + Duration::seconds(handle.load(Ordering::SeqCst)));
        (offset, registry)
    }

    #[test]
    fn test_register_then_check_drops_once() {
        let (_, registry) = registry_with_clock();
        let key = SyncKey::Dn(Dn::parse("CN=a,DC=x").unwrap());

        registry.register(&key);
        assert!(registry.check(&key));
        assert!(!registry.check(&key));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_tokens_expire() {
        let (offset, registry) = registry_with_clock();
        let key = SyncKey::Object(Uuid::new_v4());

        registry.register(&key);
        offset.store(61, Ordering::SeqCst);
        assert!(!registry.check(&key));
    }

    #[test]
    fn test_discard_withdraws_token() {
        let (_, registry) = registry_with_clock();
        let key = SyncKey::Object(Uuid::new_v4());

        registry.register(&key);
        registry.discard(&key);
        assert!(!registry.check(&key));
    }

    #[test]
    fn test_purge_counts_expired() {
        let (offset, registry) = registry_with_clock();
        registry.register(&SyncKey::Person(Uuid::new_v4()));
        offset.store(30, Ordering::SeqCst);
        registry.register(&SyncKey::Person(Uuid::new_v4()));
        offset.store(70, Ordering::SeqCst);

        assert_eq!(registry.purge(), 1);
        assert_eq!(registry.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_each_registration_consumed_exactly_once(writes in 0usize..20, checks in 0usize..40) {
            let (_, registry) = registry_with_clock();
            let key = SyncKey::Person(Uuid::nil());
            for _ in 0..writes {
                registry.register(&key);
            }
            let dropped = (0..checks).filter(|_| registry.check(&key)).count();
            prop_assert_eq!(dropped, writes.min(checks));
        }
    }
}
