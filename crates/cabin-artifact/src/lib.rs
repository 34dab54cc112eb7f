//! CabinCrew artifacts
//!
//! Content hashes, canonical metadata and artifact records shared by every
//! other crate in the workspace.
//!
//! # Core Concepts
//!
//! - [`ContentHash`]: 32-byte SHA-256 digest, hex on the wire
//! - [`MetaMap`]: ordered metadata map with a closed value type, so hashes
//!   over metadata are reproducible
//! - Opaque labels ([`ArtifactKind`], [`MimeType`], ...) for engine-defined
//!   strings, and file-safe identifiers ([`WorkflowId`], [`StepId`])
//! - [`ArtifactStore`]: where the orchestrator re-reads engine output
//!
//! # Example
//!
//! ```rust,ignore
//! use cabin_artifact::{ArtifactStore, MemoryArtifactStore, PlanArtifactHash};
//!
//! let store = MemoryArtifactStore::new();
//! let hash = store.put("artifact.txt", "hello")?;
//! let entry = PlanArtifactHash::new("artifact.txt", hash);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod artifact;
mod hash;
mod label;
mod store;
mod value;

pub use artifact::{Artifact, ArtifactRecord, PlanArtifactHash};
pub use hash::{ContentHash, FieldHasher, HashError};
pub use label::{
    ApprovalId, ArtifactAction, ArtifactKind, GatewayMethod, LabelError, MimeType, StepId,
    WorkflowId, MAX_LABEL_LEN,
};
pub use store::{ArtifactError, ArtifactStore, DirArtifactStore, MemoryArtifactStore};
pub use value::{meta_map, MetaMap, MetaValue};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
