//! Message payloads, envelopes, and canonical serialization.
//!
//! The inner [`MessagePayload`] is what peers exchange; the outer
//! [`MessageEnvelope`] is the wire form carrying it sealed and signed.
//!
//! ## Security model
//!
//! Encrypt-then-sign:
//! 1. Serialize the payload canonically
//! 2. Seal it to the recipient's X25519 key (sealed box)
//! 3. Sign the canonical envelope fields (signature omitted) with Ed25519
//!
//! The relay and any on-path observer see only ciphertext plus routing
//! metadata (`sender_fp`, `recipient_fp`, `sent_at`).
//!
//! ## Canonical form
//!
//! Both signing and cross-node interop require byte-deterministic JSON:
//! keys in ASCII order, no insignificant whitespace, UTF-8, integers in
//! decimal, binary fields as URL-safe base64 without padding. Values are
//! routed through `serde_json::Value` (BTreeMap-backed) so key order never
//! depends on struct declaration order.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::clock::SharedClock;
use crate::crypto::{self, Identity};
use crate::encoding::{b64, base64_bytes};
use crate::error::{MailError, MailResult};
use crate::peer::PeerInfo;

/// Current envelope protocol version
pub const ENVELOPE_VERSION: u32 = 0;

/// Length of the random payload nonce (128 bits)
pub const PAYLOAD_NONCE_SIZE: usize = 16;

/// What a message means to the receiving agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text for a human or agent to read
    Message,
    /// A request for the recipient to do something
    Task,
    /// Acknowledgement of an earlier message
    Ack,
}

impl std::str::FromStr for MessageKind {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "task" => Ok(Self::Task),
            "ack" => Ok(Self::Ack),
            other => Err(MailError::Serialization(format!(
                "unknown message kind: {:?}",
                other
            ))),
        }
    }
}

/// The inner plaintext of a message.
///
/// `nonce` is 128 random bits making every payload unique even when all
/// other fields collide; the receiver deduplicates on
/// `(sender_fp, nonce)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub from_addr: String,
    pub to_addr: String,
    pub subject: String,
    pub body: String,
    pub kind: MessageKind,
    /// Unix milliseconds at composition time
    pub created_at: i64,
    /// URL-safe base64 of 16 random bytes
    pub nonce: String,
}

impl MessagePayload {
    /// Compose a payload with a fresh random nonce.
    pub fn new(
        from: &Address,
        to: &Address,
        subject: impl Into<String>,
        body: impl Into<String>,
        kind: MessageKind,
        clock: &SharedClock,
    ) -> Self {
        let mut nonce = [0u8; PAYLOAD_NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        Self {
            from_addr: from.to_string(),
            to_addr: to.to_string(),
            subject: subject.into(),
            body: body.into(),
            kind,
            created_at: clock.now_millis(),
            nonce: b64(&nonce),
        }
    }
}

/// The outer wire record carrying one sealed, signed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Protocol version for forward compatibility
    pub version: u32,
    /// Sender's fingerprint (claims which key signed this)
    pub sender_fp: String,
    /// Recipient's fingerprint (routing key for the relay)
    pub recipient_fp: String,
    /// Sealed box over the canonical payload
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// Ed25519 signature over the canonical envelope with this field omitted
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    /// Unix milliseconds at send time
    pub sent_at: i64,
}

/// The envelope fields covered by the signature.
#[derive(Serialize)]
struct SigningView<'a> {
    version: u32,
    sender_fp: &'a str,
    recipient_fp: &'a str,
    #[serde(with = "base64_bytes")]
    ciphertext: &'a [u8],
    sent_at: i64,
}

/// Canonical serialization: deterministic, ASCII-sorted keys, no whitespace.
pub fn canonical_bytes<T: Serialize>(value: &T) -> MailResult<Vec<u8>> {
    let value =
        serde_json::to_value(value).map_err(|e| MailError::Serialization(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| MailError::Serialization(e.to_string()))
}

impl MessageEnvelope {
    /// Seal and sign a payload for a recipient. Pure: no I/O.
    pub fn build(
        payload: &MessagePayload,
        sender: &Identity,
        recipient: &PeerInfo,
        sent_at: i64,
    ) -> MailResult<Self> {
        let plaintext = canonical_bytes(payload)?;
        let ciphertext = crypto::seal(&recipient.enc_pk, &plaintext)?;

        let mut envelope = Self {
            version: ENVELOPE_VERSION,
            sender_fp: sender.fingerprint(),
            recipient_fp: recipient.fp.clone(),
            ciphertext,
            signature: Vec::new(),
            sent_at,
        };
        let signed = envelope.signing_bytes()?;
        envelope.signature = sender.sign(&signed).to_vec();
        Ok(envelope)
    }

    /// Verify the signature against the sender's known key, then decrypt
    /// and parse the payload. Pure: no I/O.
    ///
    /// Verification comes first: an envelope that fails it is never
    /// decrypted, let alone persisted.
    pub fn verify_and_open(
        &self,
        local: &Identity,
        known_sender_pk: &[u8; 32],
    ) -> MailResult<MessagePayload> {
        if self.version != ENVELOPE_VERSION {
            return Err(MailError::VersionUnsupported(self.version));
        }

        let signed = self.signing_bytes()?;
        crypto::verify(known_sender_pk, &signed, &self.signature)?;

        let plaintext = local.open(&self.ciphertext)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| MailError::MalformedEnvelope(format!("payload: {}", e)))
    }

    /// The canonical bytes covered by the signature.
    fn signing_bytes(&self) -> MailResult<Vec<u8>> {
        canonical_bytes(&SigningView {
            version: self.version,
            sender_fp: &self.sender_fp,
            recipient_fp: &self.recipient_fp,
            ciphertext: &self.ciphertext,
            sent_at: self.sent_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::peer::PeerSource;
    use std::sync::Arc;

    fn peer_for(identity: &Identity, name: &str) -> PeerInfo {
        PeerInfo {
            fp: identity.fingerprint(),
            name: name.to_string(),
            sign_pk: identity.sign_public(),
            enc_pk: identity.enc_public(),
            endpoint: None,
            last_seen: 0,
            source: PeerSource::Manual,
        }
    }

    fn sample_payload() -> MessagePayload {
        let clock: SharedClock = Arc::new(SystemClock);
        MessagePayload::new(
            &Address::local("alice"),
            &Address::local("bob"),
            "hi",
            "ping",
            MessageKind::Message,
            &clock,
        )
    }

    #[test]
    fn test_round_trip() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let payload = sample_payload();

        let envelope = MessageEnvelope::build(&payload, &alice, &peer_for(&bob, "bob"), 42).unwrap();
        assert_eq!(envelope.version, ENVELOPE_VERSION);
        assert_eq!(envelope.sender_fp, alice.fingerprint());
        assert_eq!(envelope.recipient_fp, bob.fingerprint());

        let opened = envelope
            .verify_and_open(&bob, &alice.sign_public())
            .unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn test_canonical_bytes_deterministic() {
        let payload = sample_payload();
        assert_eq!(
            canonical_bytes(&payload).unwrap(),
            canonical_bytes(&payload).unwrap()
        );
    }

    #[test]
    fn test_canonical_bytes_sorts_keys() {
        // Same logical object, different input key order
        let a: serde_json::Value =
            serde_json::from_str(r#"{"b": 1, "a": {"z": 2, "y": 3}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a": {"y": 3, "z": 2}, "b": 1}"#).unwrap();
        assert_eq!(canonical_bytes(&a).unwrap(), canonical_bytes(&b).unwrap());
        assert_eq!(canonical_bytes(&a).unwrap(), b"{\"a\":{\"y\":3,\"z\":2},\"b\":1}");
    }

    #[test]
    fn test_payload_nonces_are_unique() {
        let a = sample_payload();
        let b = sample_payload();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_tampered_ciphertext_fails_signature() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut envelope =
            MessageEnvelope::build(&sample_payload(), &alice, &peer_for(&bob, "bob"), 42).unwrap();
        envelope.ciphertext[0] ^= 0xff;

        assert!(matches!(
            envelope.verify_and_open(&bob, &alice.sign_public()),
            Err(MailError::BadSignature)
        ));
    }

    #[test]
    fn test_wrong_signer_is_rejected() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mallory = Identity::generate();

        // Mallory signs an envelope claiming Alice's fingerprint
        let payload = sample_payload();
        let mut envelope =
            MessageEnvelope::build(&payload, &mallory, &peer_for(&bob, "bob"), 42).unwrap();
        envelope.sender_fp = alice.fingerprint();

        assert!(matches!(
            envelope.verify_and_open(&bob, &alice.sign_public()),
            Err(MailError::BadSignature)
        ));
    }

    #[test]
    fn test_wrong_recipient_cannot_open() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let eve = Identity::generate();

        let envelope =
            MessageEnvelope::build(&sample_payload(), &alice, &peer_for(&bob, "bob"), 42).unwrap();
        // Signature verifies (it is public), but decryption must fail
        assert!(matches!(
            envelope.verify_and_open(&eve, &alice.sign_public()),
            Err(MailError::DecryptFailed)
        ));
    }

    #[test]
    fn test_unsupported_version_rejected_before_verification() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut envelope =
            MessageEnvelope::build(&sample_payload(), &alice, &peer_for(&bob, "bob"), 42).unwrap();
        envelope.version = 99;

        assert!(matches!(
            envelope.verify_and_open(&bob, &alice.sign_public()),
            Err(MailError::VersionUnsupported(99))
        ));
    }

    #[test]
    fn test_wire_form_binary_fields_are_url_safe() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let envelope =
            MessageEnvelope::build(&sample_payload(), &alice, &peer_for(&bob, "bob"), 42).unwrap();

        let wire = serde_json::to_value(&envelope).unwrap();
        for field in ["ciphertext", "signature"] {
            let s = wire[field].as_str().unwrap();
            assert!(s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[test]
    fn test_created_at_comes_from_clock() {
        let clock: SharedClock = Arc::new(ManualClock::at(1_700_000_000_000));
        let payload = MessagePayload::new(
            &Address::local("alice"),
            &Address::local("bob"),
            "",
            "",
            MessageKind::Ack,
            &clock,
        );
        assert_eq!(payload.created_at, 1_700_000_000_000);
    }
}
