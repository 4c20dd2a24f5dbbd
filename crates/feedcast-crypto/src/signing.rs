use feedcast_core::{Event, UnsignedEvent};
use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors returned by signing/verification helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SigningError {
    /// Secret bytes are not a valid secp256k1 scalar.
    #[error("invalid secret key bytes")]
    InvalidSecretKey,
    /// Pubkey bytes are not a valid x-only secp256k1 point.
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    /// Signature could not be produced or decoded.
    #[error("signature error")]
    Signature,
}

/// Turns event content into a signed event. The publish path treats the
/// result as opaque.
pub trait EventSigner: Send + Sync {
    /// Attaches author, id and signature to `unsigned`.
    fn sign(&self, unsigned: UnsignedEvent) -> Result<Event, SigningError>;
    /// Hex-encoded x-only public key of the author.
    fn public_key_hex(&self) -> String;
}

/// BIP-340 Schnorr signer over secp256k1.
#[derive(Clone)]
pub struct NostrSigner {
    signing_key: SigningKey,
    public_key_hex: String,
}

impl std::fmt::Debug for NostrSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NostrSigner")
            .field("public_key", &self.public_key_hex)
            .finish_non_exhaustive()
    }
}

impl NostrSigner {
    /// Creates a signer from a 32-byte secret key.
    pub fn from_secret(secret: [u8; 32]) -> Result<Self, SigningError> {
        let signing_key =
            SigningKey::from_bytes(&secret).map_err(|_| SigningError::InvalidSecretKey)?;
        let public_key_hex = hex::encode(signing_key.verifying_key().to_bytes());
        Ok(Self {
            signing_key,
            public_key_hex,
        })
    }

    /// Raw 32-byte x-only public key.
    pub fn public_key(&self) -> [u8; 32] {
        let mut out = [0_u8; 32];
        out.copy_from_slice(&self.signing_key.verifying_key().to_bytes());
        out
    }
}

/// `sha256` of the canonical event serialization, hex encoded.
pub fn event_id(unsigned: &UnsignedEvent, pubkey_hex: &str) -> String {
    let digest = Sha256::digest(unsigned.id_preimage(pubkey_hex).as_bytes());
    hex::encode(digest)
}

impl EventSigner for NostrSigner {
    fn sign(&self, unsigned: UnsignedEvent) -> Result<Event, SigningError> {
        let id = event_id(&unsigned, &self.public_key_hex);
        let id_bytes = hex::decode(&id).map_err(|_| SigningError::Signature)?;
        let mut aux_rand = [0_u8; 32];
        rand::thread_rng().fill_bytes(&mut aux_rand);
        let signature = self
            .signing_key
            .sign_raw(&id_bytes, &aux_rand)
            .map_err(|_| SigningError::Signature)?;
        Ok(Event {
            id,
            pubkey: self.public_key_hex.clone(),
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: hex::encode(signature.to_bytes()),
        })
    }

    fn public_key_hex(&self) -> String {
        self.public_key_hex.clone()
    }
}

/// Checks that `event.id` matches its content and `event.sig` is a valid
/// signature by `event.pubkey`.
pub fn verify_event(event: &Event) -> Result<bool, SigningError> {
    let unsigned = UnsignedEvent {
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };
    if event_id(&unsigned, &event.pubkey) != event.id {
        return Ok(false);
    }
    let pubkey = hex::decode(&event.pubkey).map_err(|_| SigningError::InvalidPublicKey)?;
    let verifying_key =
        VerifyingKey::from_bytes(&pubkey).map_err(|_| SigningError::InvalidPublicKey)?;
    let sig_bytes = hex::decode(&event.sig).map_err(|_| SigningError::Signature)?;
    let signature = Signature::try_from(sig_bytes.as_slice()).map_err(|_| SigningError::Signature)?;
    let id_bytes = hex::decode(&event.id).map_err(|_| SigningError::Signature)?;
    Ok(verifying_key.verify_raw(&id_bytes, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use feedcast_core::{UnsignedEvent, KIND_TEXT_NOTE};

    use super::{verify_event, EventSigner, NostrSigner, SigningError};

    fn note() -> UnsignedEvent {
        UnsignedEvent::new(KIND_TEXT_NOTE, "feedcast signed payload", 1_700_000_000)
            .with_tag(["t", "news"])
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let signer = NostrSigner::from_secret([0x42_u8; 32]).expect("valid secret");
        let event = signer.sign(note()).expect("sign should succeed");
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        assert_eq!(event.pubkey, signer.public_key_hex());
        assert!(verify_event(&event).expect("verify should run"));
    }

    #[test]
    fn verify_fails_when_content_changes() {
        let signer = NostrSigner::from_secret([0x10_u8; 32]).expect("valid secret");
        let mut event = signer.sign(note()).expect("sign should succeed");
        event.content.push('!');
        assert!(!verify_event(&event).expect("verify should run"));
    }

    #[test]
    fn verify_fails_when_signature_changes() {
        let signer = NostrSigner::from_secret([0xAA_u8; 32]).expect("valid secret");
        let mut event = signer.sign(note()).expect("sign should succeed");
        let flipped = if event.sig.starts_with('0') { "1" } else { "0" };
        event.sig.replace_range(0..1, flipped);
        assert!(!verify_event(&event).expect("verify should run"));
    }

    #[test]
    fn zero_secret_is_rejected() {
        assert_eq!(
            NostrSigner::from_secret([0_u8; 32]).unwrap_err(),
            SigningError::InvalidSecretKey
        );
    }

    #[test]
    fn ids_are_deterministic_for_same_author_and_content() {
        let signer = NostrSigner::from_secret([0x07_u8; 32]).expect("valid secret");
        let a = signer.sign(note()).expect("sign");
        let b = signer.sign(note()).expect("sign");
        assert_eq!(a.id, b.id);
    }
}
