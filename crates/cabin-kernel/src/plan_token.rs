//! Plan-token binding
//!
//! A plan token is a content hash over a flight-plan's artifact set and the
//! context it was produced in. Approvals and take-off are accepted only for
//! the exact token recorded at plan time.
//!
//! The hashed fields, in order, each length-delimited:
//! salt, then `name` and `hash` of every artifact sorted by name, then
//! model, engine id and workspace hash, then the policy digest and the
//! governance hash when present, each behind its own tag. `created_at` is
//! recorded but never hashed, so re-binding the same plan later yields the
//! same token.

use cabin_artifact::{ContentHash, FieldHasher, PlanArtifactHash};
use cabin_protocol::PlanToken;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Current token format version
pub const PLAN_TOKEN_VERSION: &str = "1";

/// Who and what produced a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanProvenance {
    pub model: String,
    pub engine_id: String,
    pub protocol_version: String,
    pub policy_digest: Option<ContentHash>,
    pub governance_hash: Option<ContentHash>,
}

impl PlanProvenance {
    #[must_use]
    pub fn new(
        model: impl Into<String>,
        engine_id: impl Into<String>,
        protocol_version: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            engine_id: engine_id.into(),
            protocol_version: protocol_version.into(),
            policy_digest: None,
            governance_hash: None,
        }
    }

    #[must_use]
    pub fn with_policy_digest(mut self, digest: ContentHash) -> Self {
        self.policy_digest = Some(digest);
        self
    }

    #[must_use]
    pub fn with_governance_hash(mut self, hash: ContentHash) -> Self {
        self.governance_hash = Some(hash);
        self
    }
}

/// Errors from binding a plan
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanTokenError {
    #[error("plan has no artifacts")]
    EmptyPlan,

    #[error("plan names artifact {0:?} more than once")]
    DuplicateArtifact(String),
}

/// Computes and checks plan tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanTokenBinder {
    version: String,
    salt: String,
}

impl Default for PlanTokenBinder {
    fn default() -> Self {
        Self::new(PLAN_TOKEN_VERSION, "cabincrew")
    }
}

impl PlanTokenBinder {
    #[must_use]
    pub fn new(version: impl Into<String>, salt: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            salt: salt.into(),
        }
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Bind an artifact set to its provenance
    ///
    /// Artifacts are sorted by name first, so any ordering of the same set
    /// gives the same token.
    ///
    /// # Errors
    /// - [`PlanTokenError::EmptyPlan`] for an empty set
    /// - [`PlanTokenError::DuplicateArtifact`] when a name repeats
    pub fn bind(
        &self,
        mut artifacts: Vec<PlanArtifactHash>,
        provenance: &PlanProvenance,
        workspace_hash: ContentHash,
        created_at: DateTime<Utc>,
    ) -> Result<PlanToken, PlanTokenError> {
        if artifacts.is_empty() {
            return Err(PlanTokenError::EmptyPlan);
        }
        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        let mut seen = HashSet::with_capacity(artifacts.len());
        for artifact in &artifacts {
            if !seen.insert(artifact.name.as_str()) {
                return Err(PlanTokenError::DuplicateArtifact(artifact.name.clone()));
            }
        }

        let token = self.digest(&artifacts, provenance, &workspace_hash);
        Ok(PlanToken {
            token,
            version: self.version.clone(),
            artifacts,
            model: provenance.model.clone(),
            engine_id: provenance.engine_id.clone(),
            protocol_version: provenance.protocol_version.clone(),
            workspace_hash,
            created_at,
            policy_digest: provenance.policy_digest,
            governance_hash: provenance.governance_hash,
        })
    }

    /// Does `candidate` name `token`?
    ///
    /// Compares every byte regardless of where the first difference is.
    #[must_use]
    pub fn verify(&self, candidate: &ContentHash, token: &PlanToken) -> bool {
        candidate.ct_eq(&token.token)
    }

    /// Recompute the binding for `artifacts` under `token`'s provenance
    /// and check it against `token`
    #[must_use]
    pub fn verify_artifacts(&self, token: &PlanToken, artifacts: &[PlanArtifactHash]) -> bool {
        let mut sorted = artifacts.to_vec();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        let provenance = PlanProvenance {
            model: token.model.clone(),
            engine_id: token.engine_id.clone(),
            protocol_version: token.protocol_version.clone(),
            policy_digest: token.policy_digest,
            governance_hash: token.governance_hash,
        };
        let recomputed = self.digest(&sorted, &provenance, &token.workspace_hash);
        recomputed.ct_eq(&token.token)
    }

    fn digest(
        &self,
        sorted: &[PlanArtifactHash],
        provenance: &PlanProvenance,
        workspace_hash: &ContentHash,
    ) -> ContentHash {
        let mut hasher = FieldHasher::new();
        hasher.str_field(&self.salt);
        for artifact in sorted {
            hasher
                .str_field(&artifact.name)
                .field(artifact.hash.as_bytes());
        }
        hasher
            .str_field(&provenance.model)
            .str_field(&provenance.engine_id)
            .field(workspace_hash.as_bytes());
        if let Some(digest) = &provenance.policy_digest {
            hasher.str_field("policy").field(digest.as_bytes());
        }
        if let Some(hash) = &provenance.governance_hash {
            hasher.str_field("governance").field(hash.as_bytes());
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provenance() -> PlanProvenance {
        PlanProvenance::new("gpt-4", "terraform", "1")
    }

    fn entry(name: &str, content: &str) -> PlanArtifactHash {
        PlanArtifactHash::new(name, ContentHash::compute(content.as_bytes()))
    }

    fn bind(binder: &PlanTokenBinder, artifacts: Vec<PlanArtifactHash>) -> PlanToken {
        binder
            .bind(
                artifacts,
                &provenance(),
                ContentHash::compute(b"workspace"),
                Utc::now(),
            )
            .unwrap()
    }

    #[test]
    fn order_does_not_change_token() {
        let binder = PlanTokenBinder::default();
        let a = bind(&binder, vec![entry("a", "1"), entry("b", "2")]);
        let b = bind(&binder, vec![entry("b", "2"), entry("a", "1")]);
        assert_eq!(a.token, b.token);
        assert_eq!(a.artifacts, b.artifacts);
        assert_eq!(a.artifacts[0].name, "a");
    }

    #[test]
    fn created_at_is_not_hashed() {
        let binder = PlanTokenBinder::default();
        let early = binder
            .bind(
                vec![entry("a", "1")],
                &provenance(),
                ContentHash::zero(),
                DateTime::from_timestamp(0, 0).unwrap(),
            )
            .unwrap();
        let late = binder
            .bind(vec![entry("a", "1")], &provenance(), ContentHash::zero(), Utc::now())
            .unwrap();
        assert_eq!(early.token, late.token);
    }

    #[test]
    fn salt_model_and_content_all_matter() {
        let base = bind(&PlanTokenBinder::default(), vec![entry("a", "1")]);
        let salted = bind(&PlanTokenBinder::new("1", "other"), vec![entry("a", "1")]);
        let mutated = bind(&PlanTokenBinder::default(), vec![entry("a", "2")]);
        let renamed = bind(&PlanTokenBinder::default(), vec![entry("b", "1")]);
        let other_model = PlanTokenBinder::default()
            .bind(
                vec![entry("a", "1")],
                &PlanProvenance::new("claude-3", "terraform", "1"),
                ContentHash::compute(b"workspace"),
                Utc::now(),
            )
            .unwrap();
        for other in [&salted, &mutated, &renamed, &other_model] {
            assert_ne!(base.token, other.token);
        }
    }

    #[test]
    fn policy_and_governance_are_bound() {
        let binder = PlanTokenBinder::default();
        let bind_with = |provenance: PlanProvenance| {
            binder
                .bind(
                    vec![entry("a", "1")],
                    &provenance,
                    ContentHash::compute(b"workspace"),
                    Utc::now(),
                )
                .unwrap()
        };
        let bare = bind_with(provenance());
        let strict = bind_with(provenance().with_policy_digest(ContentHash::compute(b"strict")));
        let lenient = bind_with(provenance().with_policy_digest(ContentHash::compute(b"lenient")));
        let governed = bind_with(provenance().with_governance_hash(ContentHash::compute(b"strict")));

        assert_ne!(bare.token, strict.token);
        assert_ne!(strict.token, lenient.token);
        // Same bytes under a different tag still differ
        assert_ne!(strict.token, governed.token);

        assert!(binder.verify_artifacts(&strict, &[entry("a", "1")]));
        let mut swapped = strict.clone();
        swapped.policy_digest = lenient.policy_digest;
        assert!(!binder.verify_artifacts(&swapped, &[entry("a", "1")]));
    }

    #[test]
    fn rejects_empty_and_duplicate_sets() {
        let binder = PlanTokenBinder::default();
        assert_eq!(
            binder.bind(Vec::new(), &provenance(), ContentHash::zero(), Utc::now()),
            Err(PlanTokenError::EmptyPlan)
        );
        assert_eq!(
            binder.bind(
                vec![entry("a", "1"), entry("a", "2")],
                &provenance(),
                ContentHash::zero(),
                Utc::now()
            ),
            Err(PlanTokenError::DuplicateArtifact("a".into()))
        );
    }

    #[test]
    fn verify_and_verify_artifacts() {
        let binder = PlanTokenBinder::default();
        let token = bind(&binder, vec![entry("a", "1"), entry("b", "2")]);
        assert!(binder.verify(&token.token, &token));
        assert!(!binder.verify(&ContentHash::compute(b"other"), &token));

        assert!(binder.verify_artifacts(&token, &[entry("b", "2"), entry("a", "1")]));
        assert!(!binder.verify_artifacts(&token, &[entry("a", "1"), entry("b", "3")]));
    }
}
