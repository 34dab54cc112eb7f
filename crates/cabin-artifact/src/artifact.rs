//! Artifact shapes
//!
//! - [`Artifact`]: the canonical artifact an engine emits (type, action,
//!   target, body)
//! - [`PlanArtifactHash`]: one `(name, hash)` pair bound into a plan token
//! - [`ArtifactRecord`]: the durable record the orchestrator keeps for every
//!   artifact it has verified against storage

use crate::hash::{ContentHash, HashError};
use crate::label::{ArtifactAction, ArtifactKind, MimeType, StepId};
use crate::value::{MetaMap, MetaValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical engine artifact
///
/// `artifact_type` and `action` are engine-defined; only their shape is
/// checked. Small content travels inline in `body`; larger content is
/// referenced through `body_file`, relative to the artifact directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_type: ArtifactKind,
    pub action: ArtifactAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub mime: MimeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<MetaValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetaMap>,
}

impl Artifact {
    /// New artifact with no body
    #[must_use]
    pub fn new(artifact_type: ArtifactKind, action: ArtifactAction, mime: MimeType) -> Self {
        Self {
            artifact_type,
            action,
            target: None,
            mime,
            body: None,
            body_file: None,
            metadata: None,
        }
    }

    /// Set the target
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set an inline body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<MetaValue>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Reference an external body file
    #[must_use]
    pub fn with_body_file(mut self, path: impl Into<String>) -> Self {
        self.body_file = Some(path.into());
        self
    }

    /// Attach metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: MetaMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Content hash of the inline body
    ///
    /// A string body hashes as its UTF-8 bytes so that it agrees with the
    /// hash of the same text stored as a file. Any other body hashes as its
    /// canonical JSON. Returns `None` when the body lives in `body_file`.
    ///
    /// # Errors
    /// Returns error if the body cannot be serialized
    pub fn content_hash(&self) -> Result<Option<ContentHash>, HashError> {
        match &self.body {
            None => Ok(None),
            Some(MetaValue::String(text)) => Ok(Some(ContentHash::compute(text.as_bytes()))),
            Some(other) => Ok(Some(ContentHash::compute_serializable(other)?)),
        }
    }
}

/// A single artifact's contribution to a plan token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanArtifactHash {
    pub name: String,
    pub hash: ContentHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl PlanArtifactHash {
    #[must_use]
    pub fn new(name: impl Into<String>, hash: ContentHash) -> Self {
        Self {
            name: name.into(),
            hash,
            size: None,
        }
    }

    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

/// Durable record of a verified artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    pub step_id: StepId,
    pub artifact_hash: ContentHash,
    pub artifact_type: ArtifactKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetaMap>,
}
