//! Plan token shape
//!
//! A plan token is created once per flight-plan and never mutated. Later
//! steps refer to it only through its `token` hash.

use cabin_artifact::{ContentHash, PlanArtifactHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Binding between a flight-plan and its take-off
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanToken {
    /// Hash over the artifact set and its provenance
    pub token: ContentHash,
    /// Token format version
    pub version: String,
    /// Artifacts that contributed, sorted by name
    pub artifacts: Vec<PlanArtifactHash>,
    pub model: String,
    pub engine_id: String,
    pub protocol_version: String,
    pub workspace_hash: ContentHash,
    /// Recorded for audit, not part of the hash
    pub created_at: DateTime<Utc>,
    /// Digest of the policy set active when the plan was bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_digest: Option<ContentHash>,
    /// Digest of governance context (policies, models, gateway rules)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governance_hash: Option<ContentHash>,
}

impl PlanToken {
    /// The hash later steps bind to
    #[inline]
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        self.token
    }

    /// Artifact entry by name
    #[must_use]
    pub fn artifact(&self, name: &str) -> Option<&PlanArtifactHash> {
        self.artifacts.iter().find(|a| a.name == name)
    }
}
