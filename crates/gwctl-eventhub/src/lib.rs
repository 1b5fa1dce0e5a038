//! Event distribution backend for the gateway controller.
//!
//! Publishers record tenant-scoped resource changes; in-process consumers
//! subscribe per organization and receive batches of new events. Events and
//! per-organization versions live in SQLite, so a publish is one transaction
//! and delivery survives consumer backpressure.
//!
//! - [`registry`]: organizations, subscriber channels, poll cursors (no I/O)
//! - [`store`]: SQL over `organization_states` and `events`
//! - [`backend`]: [`EventHub`] lifecycle plus the poll and cleanup loops

pub mod backend;
pub mod db;
pub mod error;
pub mod registry;
pub mod statements;
pub mod store;

pub use backend::{CleanupReport, EventHub, HubState, PollReport};
pub use error::{EventHubError, Result, StoreError};
pub use registry::{EventBatch, PollCursor, Subscriber};

pub use gwctl_core::EventHubConfig;
pub use gwctl_core::types::{Event, EventAction, EventType, NewEvent, OrganizationState};
