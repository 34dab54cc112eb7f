//! Orchestrator configuration
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! Files are TOML or YAML, chosen by extension.
//!
//! ```toml
//! protocol_version = "1"
//!
//! [plan_token]
//! salt = "cabincrew"
//!
//! [policy]
//! aggregation = "most_restrictive"
//! timeout_ms = 5000
//!
//! [approval]
//! default_role = "operator"
//! require_named_approver = true
//!
//! [wal]
//! dir = "/var/lib/cabincrew/wal"
//! ```

use crate::plan_token::PLAN_TOKEN_VERSION;
use cabin_policy::AggregationMethod;
use cabin_protocol::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unsupported config format {0:?}; use .toml, .yaml or .yml")]
    UnsupportedFormat(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Protocol version engines must speak
    pub protocol_version: String,
    pub plan_token: PlanTokenConfig,
    pub policy: PolicyConfig,
    pub approval: ApprovalConfig,
    pub wal: WalConfig,
    pub audit: AuditConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            plan_token: PlanTokenConfig::default(),
            policy: PolicyConfig::default(),
            approval: ApprovalConfig::default(),
            wal: WalConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanTokenConfig {
    pub version: String,
    /// Mixed into every token; keep stable for the life of a deployment
    pub salt: String,
}

impl Default for PlanTokenConfig {
    fn default() -> Self {
        Self {
            version: PLAN_TOKEN_VERSION.to_string(),
            salt: "cabincrew".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub aggregation: AggregationMethod,
    /// Per-backend deadline during preflight
    pub timeout_ms: u64,
    /// Rule name when `aggregation` is `custom`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_rule: Option<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            aggregation: AggregationMethod::MostRestrictive,
            timeout_ms: 5_000,
            custom_rule: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub default_role: String,
    pub require_named_approver: bool,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_role: "operator".to_string(),
            require_named_approver: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory for per-workflow log files; in-memory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines ledger file; in-memory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
    /// Reference recorded on signed events, naming the signing key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key_ref: Option<String>,
}

impl OrchestratorConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a TOML or YAML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match extension.as_str() {
            "toml" => Self::from_toml_str(&text),
            "yaml" | "yml" => Self::from_yaml_str(&text),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// Returns error on parse or validation failure
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML
    ///
    /// # Errors
    /// Returns error on parse or validation failure
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot work
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first bad value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol_version.trim().is_empty() {
            return Err(ConfigError::Invalid("protocol_version is empty".into()));
        }
        if self.plan_token.salt.is_empty() {
            return Err(ConfigError::Invalid("plan_token.salt is empty".into()));
        }
        if self.plan_token.version.trim().is_empty() {
            return Err(ConfigError::Invalid("plan_token.version is empty".into()));
        }
        if self.policy.timeout_ms == 0 {
            return Err(ConfigError::Invalid("policy.timeout_ms must be positive".into()));
        }
        if self.policy.aggregation == AggregationMethod::Custom && self.policy.custom_rule.is_none()
        {
            return Err(ConfigError::Invalid(
                "policy.aggregation = custom requires policy.custom_rule".into(),
            ));
        }
        if self.approval.default_role.trim().is_empty() {
            return Err(ConfigError::Invalid("approval.default_role is empty".into()));
        }
        if self
            .audit
            .signing_key_ref
            .as_deref()
            .is_some_and(|r| r.trim().is_empty())
        {
            return Err(ConfigError::Invalid("audit.signing_key_ref is empty".into()));
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn policy_timeout(&self) -> Duration {
        Duration::from_millis(self.policy.timeout_ms)
    }

    #[inline]
    #[must_use]
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.plan_token.salt = salt.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_aggregation(mut self, method: AggregationMethod) -> Self {
        self.policy.aggregation = method;
        self
    }

    /// Use the named custom rule for aggregation
    #[inline]
    #[must_use]
    pub fn with_custom_rule(mut self, name: impl Into<String>) -> Self {
        self.policy.aggregation = AggregationMethod::Custom;
        self.policy.custom_rule = Some(name.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_policy_timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_default_role(mut self, role: impl Into<String>) -> Self {
        self.approval.default_role = role.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_named_approver_required(mut self, required: bool) -> Self {
        self.approval.require_named_approver = required;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_wal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.wal.dir = Some(dir.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_audit_ledger(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit.ledger_path = Some(path.into());
        self
    }
}
