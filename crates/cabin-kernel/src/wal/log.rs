//! Sequenced, verified access to a [`WalStore`]

use super::entry::{WalEntry, WalEntryData};
use super::store::WalStore;
use super::WalError;
use crate::clock::{Clock, SystemClock};
use cabin_artifact::WorkflowId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Write-ahead log over a line store
///
/// Sequences are per workflow, start at 1 and never skip. Appends for one
/// workflow are serialized by that workflow's head lock; different
/// workflows never contend. The head is loaded lazily from a verified
/// replay, so a log that fails verification refuses further appends.
pub struct WriteAheadLog {
    store: Arc<dyn WalStore>,
    heads: DashMap<WorkflowId, Arc<Mutex<Option<u64>>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("workflows", &self.heads.len())
            .finish_non_exhaustive()
    }
}

impl WriteAheadLog {
    #[must_use]
    pub fn new(store: Arc<dyn WalStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(store: Arc<dyn WalStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            heads: DashMap::new(),
            clock,
        }
    }

    /// Append one entry, returning its committed sequence
    ///
    /// # Errors
    /// Returns error if the log is corrupt or the store fails
    pub fn append(&self, workflow_id: &WorkflowId, data: WalEntryData) -> Result<u64, WalError> {
        let mut committed = self.append_batch(workflow_id, vec![data])?;
        committed.pop().ok_or(WalError::EmptyBatch)
    }

    /// Append several entries as one durable write
    ///
    /// # Errors
    /// Returns error if the batch is empty, the log is corrupt or the store
    /// fails. On error nothing from the batch is committed.
    pub fn append_batch(
        &self,
        workflow_id: &WorkflowId,
        batch: Vec<WalEntryData>,
    ) -> Result<Vec<u64>, WalError> {
        let entries = self.append_batch_at(workflow_id, batch, self.clock.now())?;
        Ok(entries.iter().map(|e| e.sequence).collect())
    }

    /// Append a batch stamped with `timestamp`, returning the sealed entries
    ///
    /// # Errors
    /// Same as [`WriteAheadLog::append_batch`]
    pub fn append_batch_at(
        &self,
        workflow_id: &WorkflowId,
        batch: Vec<WalEntryData>,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<WalEntry>, WalError> {
        if batch.is_empty() {
            return Err(WalError::EmptyBatch);
        }
        let slot = self.head_slot(workflow_id);
        let mut head = slot.lock();
        let last = match *head {
            Some(last) => last,
            None => {
                let last = self.replay(workflow_id)?.last().map_or(0, |e| e.sequence);
                *head = Some(last);
                last
            }
        };

        let mut entries = Vec::with_capacity(batch.len());
        let mut lines = Vec::with_capacity(batch.len());
        for (offset, data) in (1u64..).zip(batch) {
            let entry = WalEntry::seal(last + offset, timestamp, workflow_id.clone(), data)?;
            lines.push(entry.encode()?);
            entries.push(entry);
        }
        if let Err(err) = self.store.append(workflow_id, &lines) {
            // Some of the batch may have reached the store; re-read it next time
            *head = None;
            return Err(err);
        }

        let new_last = last + entries.len() as u64;
        *head = Some(new_last);
        debug!(
            workflow_id = %workflow_id,
            first = last + 1,
            last = new_last,
            "WAL batch committed"
        );
        Ok(entries)
    }

    /// Every entry for `workflow_id`, verified, in ascending sequence
    ///
    /// # Errors
    /// Returns [`WalError::CorruptedLogEntry`] at the first entry that fails
    /// its checksum, names another workflow or breaks sequence continuity
    pub fn replay(&self, workflow_id: &WorkflowId) -> Result<Vec<WalEntry>, WalError> {
        match self.replay_prefix(workflow_id)? {
            (entries, None) => Ok(entries),
            (_, Some(err)) => Err(err),
        }
    }

    /// The verified prefix of the log plus the error that stopped replay
    ///
    /// Entries after the first failure are never returned.
    ///
    /// # Errors
    /// Returns error only if the store itself cannot be read
    pub fn replay_prefix(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<(Vec<WalEntry>, Option<WalError>), WalError> {
        let lines = self.store.read_lines(workflow_id)?;
        let mut entries = Vec::with_capacity(lines.len());
        for (position, line) in (1u64..).zip(&lines) {
            let entry = match WalEntry::decode(workflow_id, position, line) {
                Ok(entry) => entry,
                Err(err) => return Ok((entries, Some(err))),
            };
            if &entry.workflow_id != workflow_id {
                let err = WalError::CorruptedLogEntry {
                    workflow_id: workflow_id.to_string(),
                    sequence: entry.sequence,
                    reason: format!("entry belongs to workflow {}", entry.workflow_id),
                };
                return Ok((entries, Some(err)));
            }
            if entry.sequence != position {
                let err = WalError::CorruptedLogEntry {
                    workflow_id: workflow_id.to_string(),
                    sequence: entry.sequence,
                    reason: format!("expected sequence {position}"),
                };
                return Ok((entries, Some(err)));
            }
            entries.push(entry);
        }
        debug!(workflow_id = %workflow_id, entries = entries.len(), "WAL replayed");
        Ok((entries, None))
    }

    /// Workflow ids present in the store
    ///
    /// # Errors
    /// Returns error if the store cannot be listed
    pub fn workflows(&self) -> Result<Vec<WorkflowId>, WalError> {
        self.store.workflows()
    }

    fn head_slot(&self, workflow_id: &WorkflowId) -> Arc<Mutex<Option<u64>>> {
        self.heads
            .entry(workflow_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::entry::{FailureKind, WorkflowFailedData, WorkflowStartedData};
    use crate::wal::store::MemoryWalStore;
    use cabin_artifact::MetaMap;
    use cabin_protocol::State;

    fn wf(id: &str) -> WorkflowId {
        id.parse().unwrap()
    }

    fn started() -> WalEntryData {
        WalEntryData::WorkflowStarted(WorkflowStartedData {
            initial_state: State::Init,
            context: MetaMap::new(),
        })
    }

    fn failed() -> WalEntryData {
        WalEntryData::WorkflowFailed(WorkflowFailedData {
            error: "stop".into(),
            failed_step: None,
            kind: FailureKind::Cancelled,
        })
    }

    #[test]
    fn sequences_are_per_workflow_and_gap_free() {
        let wal = WriteAheadLog::new(Arc::new(MemoryWalStore::new()));
        assert_eq!(wal.append(&wf("a"), started()).unwrap(), 1);
        assert_eq!(wal.append(&wf("b"), started()).unwrap(), 1);
        assert_eq!(
            wal.append_batch(&wf("a"), vec![failed(), failed()]).unwrap(),
            vec![2, 3]
        );
        let replayed = wal.replay(&wf("a")).unwrap();
        let seqs: Vec<u64> = replayed.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn failed_append_commits_nothing_and_keeps_head() {
        let store = Arc::new(MemoryWalStore::new());
        let wal = WriteAheadLog::new(store.clone());
        wal.append(&wf("a"), started()).unwrap();
        store.fail_next_appends(1);
        assert!(wal.append_batch(&wf("a"), vec![failed(), failed()]).is_err());
        assert_eq!(store.len(&wf("a")), 1);
        assert_eq!(wal.append(&wf("a"), failed()).unwrap(), 2);
    }

    #[test]
    fn write_that_reports_failure_does_not_reuse_sequences() {
        let store = Arc::new(MemoryWalStore::new());
        let wal = WriteAheadLog::new(store.clone());
        wal.append(&wf("a"), started()).unwrap();

        store.fail_next_syncs(1);
        assert!(wal.append(&wf("a"), failed()).is_err());
        assert_eq!(store.len(&wf("a")), 2);

        assert_eq!(wal.append(&wf("a"), failed()).unwrap(), 3);
        let seqs: Vec<u64> = wal.replay(&wf("a")).unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn head_resumes_from_existing_log() {
        let store = Arc::new(MemoryWalStore::new());
        WriteAheadLog::new(store.clone())
            .append_batch(&wf("a"), vec![started(), failed()])
            .unwrap();
        let reopened = WriteAheadLog::new(store);
        assert_eq!(reopened.append(&wf("a"), failed()).unwrap(), 3);
    }

    #[test]
    fn tampered_line_halts_replay_and_blocks_appends() {
        let store = Arc::new(MemoryWalStore::new());
        let writer = WriteAheadLog::new(store.clone());
        writer
            .append_batch(&wf("a"), vec![started(), failed(), failed()])
            .unwrap();
        let second = store.read_lines(&wf("a")).unwrap()[1].replace("stop", "go");
        assert!(store.overwrite_line(&wf("a"), 1, second));

        let wal = WriteAheadLog::new(store);
        let (prefix, err) = wal.replay_prefix(&wf("a")).unwrap();
        assert_eq!(prefix.len(), 1);
        assert!(matches!(
            err,
            Some(WalError::CorruptedLogEntry { sequence: 2, .. })
        ));
        assert!(wal.replay(&wf("a")).is_err());
        assert!(wal.append(&wf("a"), failed()).unwrap_err().is_corruption());
    }

    #[test]
    fn reordered_lines_break_continuity() {
        let store = Arc::new(MemoryWalStore::new());
        let wal = WriteAheadLog::new(store.clone());
        wal.append_batch(&wf("a"), vec![started(), failed()]).unwrap();
        let lines = store.read_lines(&wf("a")).unwrap();
        store.overwrite_line(&wf("a"), 0, lines[1].clone());
        store.overwrite_line(&wf("a"), 1, lines[0].clone());
        assert!(matches!(
            wal.replay(&wf("a")),
            Err(WalError::CorruptedLogEntry { sequence: 2, .. })
        ));
    }

    #[test]
    fn empty_batch_is_rejected() {
        let wal = WriteAheadLog::new(Arc::new(MemoryWalStore::new()));
        assert!(matches!(
            wal.append_batch(&wf("a"), Vec::new()),
            Err(WalError::EmptyBatch)
        ));
    }
}
