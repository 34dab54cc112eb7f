//! Optional Ed25519 signatures over audit events
//!
//! The signature covers the event's content hash only, so one event can be
//! checked on its own, independently of where it sits in the chain.

use super::{AuditError, AuditEvent};
use cabin_artifact::ContentHash;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// Signs audit events with one Ed25519 key
pub struct AuditSigner {
    key: SigningKey,
    key_ref: String,
}

impl std::fmt::Debug for AuditSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSigner")
            .field("key_ref", &self.key_ref)
            .finish_non_exhaustive()
    }
}

impl AuditSigner {
    /// Fresh random key
    #[must_use]
    pub fn generate(key_ref: impl Into<String>) -> Self {
        let mut csprng = OsRng;
        Self {
            key: SigningKey::generate(&mut csprng),
            key_ref: key_ref.into(),
        }
    }

    #[must_use]
    pub fn from_bytes(secret: &[u8; 32], key_ref: impl Into<String>) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
            key_ref: key_ref.into(),
        }
    }

    /// Key from a hex-encoded 32-byte secret
    ///
    /// # Errors
    /// Returns [`AuditError::InvalidKey`] if the hex is malformed or the
    /// wrong length
    pub fn from_hex(secret: &str, key_ref: impl Into<String>) -> Result<Self, AuditError> {
        let bytes = hex::decode(secret.trim()).map_err(|e| AuditError::InvalidKey(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AuditError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_bytes(&secret, key_ref))
    }

    #[must_use]
    pub fn key_ref(&self) -> &str {
        &self.key_ref
    }

    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Hex-encoded signature over `content`
    #[must_use]
    pub fn sign(&self, content: &ContentHash) -> String {
        let signature: Signature = self.key.sign(content.as_bytes());
        hex::encode(signature.to_bytes())
    }
}

/// Check one event's signature against `key`
///
/// Returns `Ok(false)` for an unsigned event or a signature that does not
/// verify.
///
/// # Errors
/// Returns error if the event cannot be hashed or the signature is not
/// well-formed hex of the right length
pub fn verify_signature(event: &AuditEvent, key: &VerifyingKey) -> Result<bool, AuditError> {
    let Some(encoded) = event.signature.as_deref() else {
        return Ok(false);
    };
    let bytes = hex::decode(encoded).map_err(|e| AuditError::InvalidSignature(e.to_string()))?;
    let signature =
        Signature::from_slice(&bytes).map_err(|e| AuditError::InvalidSignature(e.to_string()))?;
    let content = event.content_hash()?;
    Ok(key.verify(content.as_bytes(), &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabin_protocol::State;
    use chrono::Utc;

    fn signed(signer: &AuditSigner) -> AuditEvent {
        let mut event = AuditEvent::new("plan_token_created", State::TokenCreated, Utc::now());
        event.signature = Some(signer.sign(&event.content_hash().unwrap()));
        event.signature_key_ref = Some(signer.key_ref().to_string());
        event
    }

    #[test]
    fn signature_verifies_with_matching_key_only() {
        let signer = AuditSigner::generate("key-1");
        let event = signed(&signer);
        assert!(verify_signature(&event, &signer.verifying_key()).unwrap());

        let other = AuditSigner::generate("key-2");
        assert!(!verify_signature(&event, &other.verifying_key()).unwrap());
    }

    #[test]
    fn edited_event_fails_verification() {
        let signer = AuditSigner::generate("key-1");
        let event = signed(&signer).with_message("added later");
        assert!(!verify_signature(&event, &signer.verifying_key()).unwrap());
    }

    #[test]
    fn unsigned_event_is_not_verified() {
        let signer = AuditSigner::generate("key-1");
        let event = AuditEvent::new("x", State::Init, Utc::now());
        assert!(!verify_signature(&event, &signer.verifying_key()).unwrap());
    }

    #[test]
    fn hex_key_round_trip() {
        let secret = [7u8; 32];
        let a = AuditSigner::from_bytes(&secret, "k");
        let b = AuditSigner::from_hex(&hex::encode(secret), "k").unwrap();
        assert_eq!(a.verifying_key(), b.verifying_key());
        assert!(AuditSigner::from_hex("abcd", "k").is_err());
    }
}
