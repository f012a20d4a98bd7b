//! Remote (HR) system access for the MO/LDAP synchronization engine.
//!
//! Provides the object model as a tagged union over the finite detail
//! kinds, validity-slice selection, primary-engagement resolution, a
//! backend trait with GraphQL and in-memory implementations, and a client
//! that dispatches writes by kind.

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod graphql;
pub mod memory;
pub mod model;
pub mod selection;

pub use api::RemoteApi;
pub use auth::{TokenManager, Tokens};
pub use client::{RemoteClient, Verb, WriteRequest};
pub use config::RemoteSettings;
pub use graphql::GraphQlRemote;
pub use memory::{MemoryRemote, RecordedWrite};
pub use model::{Address, Engagement, HasValidity, ItUser, MoObject, ObjectKind, OrgUnit, Person};
pub use selection::{resolve_primary, select_current_or_latest};
