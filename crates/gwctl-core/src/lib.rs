//! Shared types for the gateway controller's event distribution layer.
//!
//! Pure data: event records, resource kinds, persisted organization state and
//! the EventHub configuration section. Storage and delivery live in
//! `gwctl-eventhub`.

pub mod config;
pub mod types;

pub use config::{ConfigError, EventHubConfig};
