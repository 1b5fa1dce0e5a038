use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned when a string doesn't name a known [`EventType`] or [`EventAction`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseKindError {
    kind: &'static str,
    value: String,
}

/// Resource kinds the controller publishes changes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventType {
    Api,
    LlmProvider,
    LlmProxy,
    McpProxy,
    Policy,
    Certificate,
    Application,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::Api,
        EventType::LlmProvider,
        EventType::LlmProxy,
        EventType::McpProxy,
        EventType::Policy,
        EventType::Certificate,
        EventType::Application,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Api => "api",
            EventType::LlmProvider => "llm_provider",
            EventType::LlmProxy => "llm_proxy",
            EventType::McpProxy => "mcp_proxy",
            EventType::Policy => "policy",
            EventType::Certificate => "certificate",
            EventType::Application => "application",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseKindError {
                kind: "event type",
                value: s.to_owned(),
            })
    }
}

/// What happened to the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Create,
    Update,
    Delete,
}

impl EventAction {
    pub fn as_str(self) -> &'static str {
        match self {
            EventAction::Create => "create",
            EventAction::Update => "update",
            EventAction::Delete => "delete",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventAction {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(EventAction::Create),
            "update" => Ok(EventAction::Update),
            "delete" => Ok(EventAction::Delete),
            other => Err(ParseKindError {
                kind: "event action",
                value: other.to_owned(),
            }),
        }
    }
}
