//! CabinCrew protocol
//!
//! Messages exchanged at the orchestrator's boundaries: engine input and
//! output, preflight, human approval and the LLM/MCP gateways, plus the
//! decision and lifecycle enums every other crate speaks.
//!
//! # Example
//!
//! ```rust,ignore
//! use cabin_protocol::{EngineOutput, Mode};
//!
//! let output: EngineOutput = serde_json::from_slice(&stdout)?;
//! output.validate(Mode::FlightPlan)?;
//! output.require_success()?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod approval;
pub mod decision;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod plan;
pub mod preflight;
pub mod state;

pub use approval::{ApprovalRecord, ApprovalRequest, ApprovalResponse};
pub use decision::Decision;
pub use engine::{
    EngineArtifact, EngineInput, EngineMeta, EngineMetric, EngineOrchestrator, EngineOutput,
    EngineStatus, Mode,
};
pub use error::ValidationError;
pub use gateway::{
    GatewayApproval, GatewayKind, GatewayResponse, GatewayRule, GatewayVerdict,
    LlmGatewayPolicyConfig, LlmGatewayRequest, LlmGatewayResponse, McpGatewayPolicyConfig,
    McpGatewayRequest, McpGatewayResponse,
};
pub use plan::PlanToken;
pub use preflight::{PreflightEvidence, PreflightInput, PreflightOutput, PreflightRequires};
pub use state::{LegacyState, State, WorkflowState};

/// Protocol version this build speaks
pub const PROTOCOL_VERSION: &str = "1";

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
