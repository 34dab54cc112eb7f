//! Policy decisions and their severity order

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::error::ValidationError;

/// Outcome of a policy check
///
/// Variants are declared in ascending severity so that the derived `Ord`
/// agrees with [`Decision::severity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Warn,
    RequireApproval,
    Deny,
}

impl Decision {
    /// All decisions, least restrictive first
    pub const ALL: [Decision; 4] = [
        Decision::Allow,
        Decision::Warn,
        Decision::RequireApproval,
        Decision::Deny,
    ];

    /// Severity used for "most restrictive" ordering: allow=0 .. deny=3
    #[inline]
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::Allow => 0,
            Self::Warn => 1,
            Self::RequireApproval => 2,
            Self::Deny => 3,
        }
    }

    /// Decision for a severity value
    #[must_use]
    pub const fn from_severity(severity: u8) -> Option<Self> {
        match severity {
            0 => Some(Self::Allow),
            1 => Some(Self::Warn),
            2 => Some(Self::RequireApproval),
            3 => Some(Self::Deny),
            _ => None,
        }
    }

    /// Whether take-off may proceed without a human
    #[inline]
    #[must_use]
    pub const fn proceeds(self) -> bool {
        matches!(self, Self::Allow | Self::Warn)
    }

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Warn => "warn",
            Self::RequireApproval => "require_approval",
            Self::Deny => "deny",
        }
    }
}

impl Display for Decision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownValue {
                field: "decision",
                value: s.to_string(),
            })
    }
}
