//! WAL line storage
//!
//! A store only keeps opaque lines per workflow; sequencing and checksums
//! belong to [`WriteAheadLog`](super::WriteAheadLog).

use super::WalError;
use cabin_artifact::WorkflowId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

const WAL_SUFFIX: &str = ".wal.jsonl";

/// Durable append-only storage for WAL lines
pub trait WalStore: Send + Sync {
    /// Append `lines` for `workflow_id`; must be durable when this returns
    ///
    /// # Errors
    /// Returns error if the lines could not be persisted
    fn append(&self, workflow_id: &WorkflowId, lines: &[String]) -> Result<(), WalError>;

    /// Every line stored for `workflow_id`, in append order
    ///
    /// # Errors
    /// Returns error if the log could not be read
    fn read_lines(&self, workflow_id: &WorkflowId) -> Result<Vec<String>, WalError>;

    /// Workflow ids with at least one stored line
    ///
    /// # Errors
    /// Returns error if the store could not be listed
    fn workflows(&self) -> Result<Vec<WorkflowId>, WalError>;
}

/// In-memory store for tests
///
/// Supports failing upcoming appends and overwriting stored lines, to
/// exercise persistence failures and tampering.
#[derive(Debug, Default)]
pub struct MemoryWalStore {
    logs: RwLock<BTreeMap<WorkflowId, Vec<String>>>,
    fail_appends: AtomicUsize,
    fail_syncs: AtomicUsize,
}

impl MemoryWalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail without storing anything
    pub fn fail_next_appends(&self, count: usize) {
        self.fail_appends.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` appends store their lines and then fail, as a
    /// write whose sync failed would
    pub fn fail_next_syncs(&self, count: usize) {
        self.fail_syncs.store(count, Ordering::SeqCst);
    }

    /// Replace the stored line at `index` (0-based). Returns false if absent.
    pub fn overwrite_line(&self, workflow_id: &WorkflowId, index: usize, line: String) -> bool {
        let mut logs = self.logs.write();
        match logs.get_mut(workflow_id).and_then(|l| l.get_mut(index)) {
            Some(slot) => {
                *slot = line;
                true
            }
            None => false,
        }
    }

    /// Number of lines stored for `workflow_id`
    #[must_use]
    pub fn len(&self, workflow_id: &WorkflowId) -> usize {
        self.logs.read().get(workflow_id).map_or(0, Vec::len)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl WalStore for MemoryWalStore {
    fn append(&self, workflow_id: &WorkflowId, lines: &[String]) -> Result<(), WalError> {
        if Self::take(&self.fail_appends) {
            return Err(WalError::Io(io::Error::other("injected append failure")));
        }
        self.logs
            .write()
            .entry(workflow_id.clone())
            .or_default()
            .extend(lines.iter().cloned());
        if Self::take(&self.fail_syncs) {
            return Err(WalError::Io(io::Error::other("injected sync failure")));
        }
        Ok(())
    }

    fn read_lines(&self, workflow_id: &WorkflowId) -> Result<Vec<String>, WalError> {
        Ok(self.logs.read().get(workflow_id).cloned().unwrap_or_default())
    }

    fn workflows(&self) -> Result<Vec<WorkflowId>, WalError> {
        Ok(self
            .logs
            .read()
            .iter()
            .filter(|(_, lines)| !lines.is_empty())
            .map(|(id, _)| id.clone())
            .collect())
    }
}

/// One JSON-lines file per workflow under a directory
///
/// Each append is a single `write_all` of the whole batch followed by
/// `sync_data`. The directory is synced when a log file is first created
/// so the new name survives a crash.
#[derive(Debug, Clone)]
pub struct FileWalStore {
    dir: PathBuf,
}

impl FileWalStore {
    /// Open (creating if needed) a WAL directory
    ///
    /// # Errors
    /// Returns error if the directory cannot be created
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, WalError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, workflow_id: &WorkflowId) -> PathBuf {
        self.dir.join(format!("{workflow_id}{WAL_SUFFIX}"))
    }

    fn sync_dir(&self) -> io::Result<()> {
        // Directory fsync is not available everywhere; opening a directory
        // fails on Windows
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

impl WalStore for FileWalStore {
    fn append(&self, workflow_id: &WorkflowId, lines: &[String]) -> Result<(), WalError> {
        let path = self.path_for(workflow_id);
        let created = !path.exists();

        let mut buf = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let committed_len = file.metadata()?.len();
        if let Err(err) = file.write_all(buf.as_bytes()).and_then(|()| file.sync_data()) {
            // Drop a torn or unsynced batch so the file ends on a whole entry
            if let Err(truncate) = file.set_len(committed_len).and_then(|()| file.sync_data()) {
                tracing::error!(
                    path = %path.display(),
                    error = %truncate,
                    "could not roll back failed WAL append"
                );
            }
            return Err(err.into());
        }
        if created {
            self.sync_dir()?;
        }
        Ok(())
    }

    fn read_lines(&self, workflow_id: &WorkflowId) -> Result<Vec<String>, WalError> {
        let path = self.path_for(workflow_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    }

    fn workflows(&self) -> Result<Vec<WorkflowId>, WalError> {
        let mut ids = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let name = dirent?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(WAL_SUFFIX)) else {
                continue;
            };
            match WorkflowId::new(stem) {
                Ok(id) => ids.push(id),
                Err(e) => tracing::warn!(file = stem, error = %e, "skipping unrecognized WAL file"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
