//! LLM and MCP gateway messages
//!
//! Both gateways answer with the same [`GatewayVerdict`]; they differ only in
//! how they rewrite the payload they forward.

use crate::decision::Decision;
use cabin_artifact::{GatewayMethod, MetaMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Approval a gateway asks for before forwarding
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayApproval {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Verdict shared by every gateway response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayVerdict {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<GatewayApproval>,
}

impl GatewayVerdict {
    #[must_use]
    pub fn new(decision: Decision) -> Self {
        Self {
            decision,
            warnings: Vec::new(),
            violations: Vec::new(),
            approval: None,
        }
    }
}

/// Which gateway produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    Llm,
    Mcp,
}

impl GatewayKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Mcp => "mcp",
        }
    }
}

/// Common view over gateway responses
pub trait GatewayResponse {
    /// Gateway that answered
    fn kind(&self) -> GatewayKind;

    /// Correlation id of the request
    fn request_id(&self) -> &str;

    /// Shared verdict
    fn verdict(&self) -> &GatewayVerdict;

    /// Model (LLM) or tool method (MCP) the verdict applies to
    fn subject(&self) -> Option<&str> {
        None
    }
}

/// Request intercepted by the LLM gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmGatewayRequest {
    pub request_id: String,
    pub model: String,
    pub input: MetaMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<MetaMap>,
    pub timestamp: DateTime<Utc>,
}

/// LLM gateway answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmGatewayResponse {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub verdict: GatewayVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routed_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewritten_input: Option<MetaMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_payload: Option<MetaMap>,
}

impl GatewayResponse for LlmGatewayResponse {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Llm
    }

    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn verdict(&self) -> &GatewayVerdict {
        &self.verdict
    }

    fn subject(&self) -> Option<&str> {
        self.routed_model.as_deref()
    }
}

/// Tool call intercepted by the MCP gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpGatewayRequest {
    pub request_id: String,
    pub server_id: String,
    pub method: GatewayMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<MetaMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<MetaMap>,
    pub timestamp: DateTime<Utc>,
}

/// MCP gateway answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpGatewayResponse {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub verdict: GatewayVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewritten_request: Option<MetaMap>,
}

impl GatewayResponse for McpGatewayResponse {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Mcp
    }

    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn verdict(&self) -> &GatewayVerdict {
        &self.verdict
    }
}

/// Static gateway rule: when every `match` key equals the request's value,
/// apply `action`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRule {
    #[serde(rename = "match")]
    pub matcher: MetaMap,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetaMap>,
}

impl GatewayRule {
    /// Whether this rule matches `fields`
    ///
    /// An empty matcher matches everything.
    #[must_use]
    pub fn matches(&self, fields: &MetaMap) -> bool {
        self.matcher
            .iter()
            .all(|(key, expected)| fields.get(key) == Some(expected))
    }
}

/// LLM gateway policy configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmGatewayPolicyConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<GatewayRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opa_policies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub onnx_models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_routing: Option<MetaMap>,
}

/// MCP gateway policy configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpGatewayPolicyConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<GatewayRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opa_policies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub onnx_models: Vec<String>,
}

/// First rule in `rules` that matches `fields`
#[must_use]
pub fn first_matching_rule<'a>(rules: &'a [GatewayRule], fields: &MetaMap) -> Option<&'a GatewayRule> {
    rules.iter().find(|rule| rule.matches(fields))
}
