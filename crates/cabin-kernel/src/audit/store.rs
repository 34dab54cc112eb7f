//! Audit ledger persistence

use super::{AuditError, AuditEvent};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Append-only storage for sealed audit events
pub trait AuditStore: Send + Sync {
    /// Persist one event at the end of the ledger
    ///
    /// # Errors
    /// Returns error if the event could not be persisted
    fn append(&self, event: &AuditEvent) -> Result<(), AuditError>;

    /// Every stored event in ledger order
    ///
    /// # Errors
    /// Returns error if the ledger could not be read or parsed
    fn load(&self) -> Result<Vec<AuditEvent>, AuditError>;
}

/// In-memory ledger
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the event at `index`, bypassing the chain. Returns false if
    /// there is no such event.
    pub fn replace(&self, index: usize, event: AuditEvent) -> bool {
        match self.events.write().get_mut(index) {
            Some(slot) => {
                *slot = event;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.write().push(event.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self.events.read().clone())
    }
}

/// JSON-lines ledger file, synced after every event
#[derive(Debug)]
pub struct FileAuditStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAuditStore {
    /// Open a ledger file, creating its parent directory if needed
    ///
    /// # Errors
    /// Returns error if the parent directory cannot be created
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditStore for FileAuditStore {
    fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line)
                .map_err(|e| AuditError::MalformedEvent { index, reason: e.to_string() })?;
            events.push(event);
        }
        Ok(events)
    }
}
