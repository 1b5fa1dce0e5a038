use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted per-organization version row.
///
/// `version_id` is regenerated on every successful publish. An empty
/// `version_id` means the organization was registered but never published to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationState {
    pub organization_id: String,
    pub version_id: String,
    pub updated_at: DateTime<Utc>,
}

impl OrganizationState {
    pub fn is_published(&self) -> bool {
        !self.version_id.is_empty()
    }
}
