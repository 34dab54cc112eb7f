//! Artifact storage boundary
//!
//! The orchestrator never trusts hashes reported by an engine. It reads the
//! stored bytes back through an [`ArtifactStore`] and hashes them itself.

use crate::hash::ContentHash;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Read access to engine-produced artifact content
pub trait ArtifactStore: Send + Sync {
    /// Whether an artifact exists at `path`
    ///
    /// # Errors
    /// Returns error if the path escapes the store root
    fn exists(&self, path: &str) -> Result<bool, ArtifactError>;

    /// Read the artifact bytes at `path`
    ///
    /// # Errors
    /// Returns [`ArtifactError::NotFound`] if absent, or an I/O error
    fn read(&self, path: &str) -> Result<Vec<u8>, ArtifactError>;

    /// Hash the stored content at `path`
    ///
    /// # Errors
    /// Same as [`ArtifactStore::read`]
    fn hash(&self, path: &str) -> Result<(ContentHash, u64), ArtifactError> {
        let bytes = self.read(path)?;
        Ok((ContentHash::compute(&bytes), bytes.len() as u64))
    }
}

/// Errors raised by artifact storage and verification
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// Path is absolute or walks out of the root
    #[error("artifact path escapes store root: {0}")]
    PathEscape(String),

    /// Nothing stored at the path
    #[error("artifact not found: {0}")]
    NotFound(String),

    /// Stored content hashes differently than reported
    #[error("artifact hash mismatch for {name}: expected {expected}, got {actual}")]
    HashMismatch {
        name: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Underlying I/O failure
    #[error("artifact I/O error: {0}")]
    Io(#[from] io::Error),
}

fn normalize(path: &str) -> Result<PathBuf, ArtifactError> {
    let candidate = Path::new(path);
    if path.is_empty() || candidate.is_absolute() {
        return Err(ArtifactError::PathEscape(path.to_string()));
    }
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArtifactError::PathEscape(path.to_string()));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ArtifactError::PathEscape(path.to_string()));
    }
    Ok(clean)
}

/// Artifacts stored as files under a root directory
#[derive(Debug, Clone)]
pub struct DirArtifactStore {
    root: PathBuf,
}

impl DirArtifactStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ArtifactError> {
        Ok(self.root.join(normalize(path)?))
    }
}

impl ArtifactStore for DirArtifactStore {
    fn exists(&self, path: &str) -> Result<bool, ArtifactError> {
        Ok(self.resolve(path)?.is_file())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, ArtifactError> {
        let full = self.resolve(path)?;
        match std::fs::read(&full) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory artifact store
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    files: RwLock<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryArtifactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes at `path`, returning their hash
    ///
    /// # Errors
    /// Returns error if the path escapes the root
    pub fn put(&self, path: &str, bytes: impl Into<Vec<u8>>) -> Result<ContentHash, ArtifactError> {
        let key = normalize(path)?;
        let bytes = bytes.into();
        let hash = ContentHash::compute(&bytes);
        self.files.write().insert(key, bytes);
        Ok(hash)
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn exists(&self, path: &str) -> Result<bool, ArtifactError> {
        let key = normalize(path)?;
        Ok(self.files.read().contains_key(&key))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, ArtifactError> {
        let key = normalize(path)?;
        self.files
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(path.to_string()))
    }
}
