//! CabinCrew policy aggregation
//!
//! Turns many independent policy verdicts into one decision.
//!
//! # Core Concepts
//!
//! - [`PolicyEvaluation`]: one backend's decision plus a severity that must
//!   agree with it
//! - [`PolicyAggregator`]: deterministic combination under an
//!   [`AggregationMethod`]; an empty list is an error, never an `allow`
//! - [`gather_evaluations`]: concurrent backend calls where timeouts and
//!   failures count as `deny`
//!
//! # Example
//!
//! ```rust,ignore
//! use cabin_policy::{gather_evaluations, AggregationMethod, PolicyAggregator};
//!
//! let evaluations = gather_evaluations(&backends, &input, timeout).await;
//! let aggregate = PolicyAggregator::new(AggregationMethod::MostRestrictive)
//!     .aggregate(evaluations)?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod aggregator;
mod backend;
mod error;
mod evaluation;

pub use aggregator::{
    AggregateDecision, AggregationMethod, CustomRule, CustomVerdict, PolicyAggregator,
};
pub use backend::{
    gather_evaluations, PolicyBackend, SharedBackend, POLICY_ERROR_PREFIX, POLICY_TIMEOUT_REASON,
};
pub use error::PolicyError;
pub use evaluation::{PolicyEvaluation, PolicyEvaluationRecord, PolicySource};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
