//! Hash-chained audit ledger

use super::signing::AuditSigner;
use super::store::AuditStore;
use super::{AuditError, AuditEvent};
use cabin_artifact::ContentHash;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Outcome of recomputing a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    /// First event whose stored chain hash does not match
    pub first_broken_index: Option<usize>,
    /// Events examined, including the broken one
    pub events_checked: usize,
}

/// Recompute the chain over `events` from the zero genesis hash
///
/// Stops at the first event whose stored chain hash is missing or differs
/// from the recomputed one. Events before it are trusted.
#[must_use]
pub fn verify_chain(events: &[AuditEvent]) -> ChainVerification {
    let mut previous = ContentHash::zero();
    for (index, event) in events.iter().enumerate() {
        let expected = event.content_hash().map(|content| previous.link(&content));
        match (expected, event.chain_hash) {
            (Ok(expected), Some(stored)) if expected.ct_eq(&stored) => previous = stored,
            _ => {
                return ChainVerification {
                    valid: false,
                    first_broken_index: Some(index),
                    events_checked: index + 1,
                }
            }
        }
    }
    ChainVerification {
        valid: true,
        first_broken_index: None,
        events_checked: events.len(),
    }
}

/// Append-only ledger where each event commits to everything before it
///
/// `chain_hash(n) = SHA-256(chain_hash(n-1) ∥ content_hash(n))`, with an
/// all-zero hash before the first event.
pub struct AuditChain {
    store: Arc<dyn AuditStore>,
    signer: Option<AuditSigner>,
    head: Mutex<ContentHash>,
}

impl std::fmt::Debug for AuditChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditChain")
            .field("head", &self.head.lock().short())
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl AuditChain {
    /// Open a ledger, verifying what is already stored and resuming from
    /// its head
    ///
    /// # Errors
    /// Returns [`AuditError::BrokenChain`] if the stored ledger does not
    /// verify, or a store error if it cannot be read
    pub fn open(store: Arc<dyn AuditStore>, signer: Option<AuditSigner>) -> Result<Self, AuditError> {
        let events = store.load()?;
        let verification = verify_chain(&events);
        if let Some(index) = verification.first_broken_index {
            return Err(AuditError::BrokenChain { index });
        }
        let head = events
            .last()
            .and_then(|e| e.chain_hash)
            .unwrap_or_else(ContentHash::zero);
        Ok(Self {
            store,
            signer,
            head: Mutex::new(head),
        })
    }

    /// Seal `event` onto the chain and persist it
    ///
    /// # Errors
    /// Returns error if the event cannot be hashed or stored; the head does
    /// not move on error
    pub fn append(&self, mut event: AuditEvent) -> Result<AuditEvent, AuditError> {
        let mut head = self.head.lock();
        let content = event.content_hash()?;
        let chain_hash = head.link(&content);
        event.chain_hash = Some(chain_hash);
        match &self.signer {
            Some(signer) => {
                event.signature = Some(signer.sign(&content));
                event.signature_key_ref = Some(signer.key_ref().to_string());
            }
            None => {
                event.signature = None;
                event.signature_key_ref = None;
            }
        }
        self.store.append(&event)?;
        *head = chain_hash;
        debug!(
            event_type = %event.event_type,
            chain_hash = %chain_hash.short(),
            "audit event appended"
        );
        Ok(event)
    }

    /// Every event in the ledger
    ///
    /// # Errors
    /// Returns error if the store cannot be read
    pub fn events(&self) -> Result<Vec<AuditEvent>, AuditError> {
        self.store.load()
    }

    /// Recompute the stored chain
    ///
    /// # Errors
    /// Returns error if the store cannot be read
    pub fn verify(&self) -> Result<ChainVerification, AuditError> {
        Ok(verify_chain(&self.events()?))
    }

    /// Chain hash of the last appended event (zero when empty)
    #[must_use]
    pub fn head(&self) -> ContentHash {
        *self.head.lock()
    }

    #[must_use]
    pub fn signer(&self) -> Option<&AuditSigner> {
        self.signer.as_ref()
    }
}
