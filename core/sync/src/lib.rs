//! MO/LDAP Sync Engine
//!
//! Bidirectional synchronization between the remote HR system and an LDAP
//! directory:
//! - Echo suppression of the engine's own writes
//! - Per-person and per-DN exclusivity
//! - Template-driven mapping between entries and remote objects
//! - Reconciliation of candidates against existing objects
//! - Retry of transient inconsistencies with exponential backoff
//! - Concurrent event dispatch with org-unit cascades

pub mod config;
pub mod dispatcher;
pub mod echo;
pub mod events;
pub mod exclusivity;
pub mod key;
pub mod mapping;
pub mod orchestrator;
pub mod reconcile;
pub mod retry;
pub mod template;

// Re-export main types
pub use config::SyncSettings;
pub use dispatcher::{report_failure, EventDispatcher};
pub use echo::EchoRegistry;
pub use events::{RemoteEvent, SyncEvent};
pub use exclusivity::{KeyGuard, KeyedLocks};
pub use key::SyncKey;
pub use mapping::{Candidate, KindMapping, Mapper, MappingContext, MappingSettings, TemplateMapper};
pub use orchestrator::{shared_values_guard, Outcome, SyncOrchestrator};
pub use reconcile::{filter_duplicate_engagements, reconcile, Decision, MatchKey, SkipReason};
pub use retry::{RetryConfig, RetryExecutor, RetrySettings};
pub use template::Template;
