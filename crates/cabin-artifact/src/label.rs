//! Validated opaque labels
//!
//! Engines name their own artifact types, actions, mime types and gateway
//! methods. These are carried as opaque strings that pass a shape check, so
//! a new engine kind needs no code change here.
//!
//! Identifiers (`WorkflowId`, `StepId`, `ApprovalId`) use a stricter
//! alphabet because they become file names and WAL keys.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Maximum label length in bytes
pub const MAX_LABEL_LEN: usize = 128;

static LABEL_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:/+=; -]*$").ok());

static IDENT_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").ok());

fn check(kind: &'static str, value: &str, re: &Lazy<Option<Regex>>) -> Result<(), LabelError> {
    if value.is_empty() {
        return Err(LabelError::Empty { kind });
    }
    if value.len() > MAX_LABEL_LEN {
        return Err(LabelError::TooLong {
            kind,
            len: value.len(),
        });
    }
    let Some(re) = re.as_ref() else {
        return Err(LabelError::Pattern { kind });
    };
    if !re.is_match(value) {
        return Err(LabelError::InvalidCharacters {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Errors produced when validating a label
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    /// Empty string
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },

    /// Longer than [`MAX_LABEL_LEN`]
    #[error("{kind} too long: {len} bytes (max {max})", max = MAX_LABEL_LEN)]
    TooLong { kind: &'static str, len: usize },

    /// Contains characters outside the allowed alphabet
    #[error("{kind} contains invalid characters: {value:?}")]
    InvalidCharacters { kind: &'static str, value: String },

    /// Validation pattern failed to compile
    #[error("{kind} validation pattern unavailable")]
    Pattern { kind: &'static str },
}

macro_rules! validated_string {
    ($(#[$doc:meta])* $name:ident, $kind:literal, $re:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a string
            ///
            /// # Errors
            /// Returns [`LabelError`] if the value is empty, too long or
            /// contains characters outside the allowed alphabet
            pub fn new(value: impl Into<String>) -> Result<Self, LabelError> {
                let value = value.into();
                check($kind, &value, &$re)?;
                Ok(Self(value))
            }

            /// Borrow as `&str`
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = LabelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = LabelError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = LabelError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

validated_string!(
    /// Engine-defined artifact type (`terraform_plan`, `sql_migration`, ...)
    ArtifactKind,
    "artifact_type",
    LABEL_RE
);

validated_string!(
    /// Engine-defined artifact action (`create`, `apply`, ...)
    ArtifactAction,
    "action",
    LABEL_RE
);

validated_string!(
    /// Media type of an artifact body
    MimeType,
    "mime",
    LABEL_RE
);

validated_string!(
    /// Gateway method name (`chat.completions`, `tools/call`, ...)
    GatewayMethod,
    "method",
    LABEL_RE
);

validated_string!(
    /// Workflow identifier, unique per orchestrator
    WorkflowId,
    "workflow_id",
    IDENT_RE
);

validated_string!(
    /// Step identifier within a workflow
    StepId,
    "step_id",
    IDENT_RE
);

validated_string!(
    /// Approval identifier, single-use
    ApprovalId,
    "approval_id",
    IDENT_RE
);

impl ApprovalId {
    /// Fresh random approval id
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("apr-{}", uuid::Uuid::new_v4().simple()))
    }
}

impl StepId {
    /// Step id for the n-th step of a phase (`preflight-2`)
    #[must_use]
    pub fn numbered(prefix: &str, n: u64) -> Option<Self> {
        Self::new(format!("{prefix}-{n}")).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_engine_defined_kinds() {
        for kind in ["terraform_plan", "sql-migration", "k8s.manifest", "x:y/z"] {
            assert!(ArtifactKind::new(kind).is_ok(), "{kind}");
        }
        assert!(MimeType::new("text/plain; charset=utf-8").is_ok());
    }

    #[test]
    fn rejects_empty_and_overlong() {
        assert_eq!(
            ArtifactKind::new(""),
            Err(LabelError::Empty {
                kind: "artifact_type"
            })
        );
        let long = "a".repeat(MAX_LABEL_LEN + 1);
        assert!(matches!(
            ArtifactKind::new(long),
            Err(LabelError::TooLong { len: 129, .. })
        ));
    }

    #[test]
    fn identifiers_are_file_safe() {
        assert!(WorkflowId::new("wf1").is_ok());
        assert!(WorkflowId::new("wf_1.retry-2").is_ok());
        assert!(WorkflowId::new("../etc").is_err());
        assert!(WorkflowId::new("a/b").is_err());
        assert!(WorkflowId::new("has space").is_err());
    }

    #[test]
    fn serde_validates_on_deserialize() {
        let ok: Result<StepId, _> = serde_json::from_str("\"step-1\"");
        assert_eq!(ok.unwrap().as_str(), "step-1");
        let bad: Result<StepId, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }

    #[test]
    fn generated_approval_ids_are_distinct() {
        let a = ApprovalId::generate();
        let b = ApprovalId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("apr-"));
    }
}
