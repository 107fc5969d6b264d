/// Conflict bookkeeping: detected disagreements between local and
/// remote/concurrent state that require explicit resolution.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use page::ComponentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(pub Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// A content save was rejected with a version mismatch.
    Content,
    /// Two structural moves targeted the same slot.
    Structure,
}

/// One unresolved conflict. `subject` identifies the conflicted thing:
/// the content key for content conflicts, the component id for
/// structural ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictItem {
    pub id: ConflictId,
    pub kind: ConflictKind,
    pub subject: String,
    pub component_id: Option<ComponentId>,
    pub local_version: String,
    pub remote_version: String,
    pub conflicted_at: DateTime<Utc>,
    pub conflicted_by: String,
}

impl ConflictItem {
    pub fn content(
        content_key: impl Into<String>,
        local_version: impl Into<String>,
        remote_version: impl Into<String>,
        conflicted_by: impl Into<String>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            kind: ConflictKind::Content,
            subject: content_key.into(),
            component_id: None,
            local_version: local_version.into(),
            remote_version: remote_version.into(),
            conflicted_at: Utc::now(),
            conflicted_by: conflicted_by.into(),
        }
    }

    pub fn structure(
        component_id: ComponentId,
        local_version: impl Into<String>,
        remote_version: impl Into<String>,
        conflicted_by: impl Into<String>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            kind: ConflictKind::Structure,
            subject: component_id.to_string(),
            component_id: Some(component_id),
            local_version: local_version.into(),
            remote_version: remote_version.into(),
            conflicted_at: Utc::now(),
            conflicted_by: conflicted_by.into(),
        }
    }
}

/// How to settle a conflict. Chosen by the caller, never by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    AcceptLocal,
    AcceptRemote,
    Merge,
}
