//! Cryptographic identity, signing, and sealed-box encryption.
//!
//! Each node owns two keypairs, generated once and persisted:
//! - Ed25519 signing keypair (identity + envelope signatures)
//! - X25519 encryption keypair (sealed boxes)
//!
//! ## Sealed boxes
//!
//! Sealed boxes are anonymous public-key encryption: the sender generates an
//! ephemeral X25519 keypair per message, so the ciphertext does not
//! authenticate the sender. Authentication comes from the envelope signature.
//!
//! ```text
//! 1. ephemeral keypair (eph_sk, eph_pk)
//! 2. shared = x25519(eph_sk, recipient_pk)
//! 3. key    = HKDF-SHA256(shared || eph_pk || recipient_pk, "agentmail-seal-v0")
//! 4. wire   = eph_pk (32) || nonce (12) || ChaCha20-Poly1305 ciphertext+tag
//! ```

use std::path::Path;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::encoding::{b64, b64_decode_key};
use crate::error::{MailError, MailResult};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Detached Ed25519 signature length
pub const SIGNATURE_SIZE: usize = 64;

/// Fixed sealed-box overhead: ephemeral key + nonce + AEAD tag
pub const SEAL_OVERHEAD: usize = 32 + NONCE_SIZE + 16;

/// Domain separation string for the sealed-box HKDF
const HKDF_INFO: &[u8] = b"agentmail-seal-v0";

/// Number of fingerprint characters taken from the encoded signing key
const FINGERPRINT_LEN: usize = 16;

/// A node's cryptographic identity.
///
/// Immutable after load. The signing key doubles as the node's identity:
/// its fingerprint is the stable peer identifier used in envelopes, the
/// relay registry and mDNS TXT records.
pub struct Identity {
    signing: SigningKey,
    encryption: X25519StaticSecret,
}

/// On-disk form of [`Identity`]: four URL-safe base64 strings.
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    sign_sk: String,
    sign_pk: String,
    enc_sk: String,
    enc_pk: String,
}

impl Identity {
    /// Generate a fresh identity from the system CSPRNG.
    pub fn generate() -> Self {
        // getrandom directly, avoiding rand version coupling for key material
        let mut sign_seed = [0u8; 32];
        getrandom::getrandom(&mut sign_seed).expect("system CSPRNG unavailable");
        let mut enc_seed = [0u8; 32];
        getrandom::getrandom(&mut enc_seed).expect("system CSPRNG unavailable");

        Self {
            signing: SigningKey::from_bytes(&sign_seed),
            encryption: X25519StaticSecret::from(enc_seed),
        }
    }

    /// Load the identity from `path`, or generate and persist a new one.
    pub fn load_or_create(path: &Path) -> MailResult<Self> {
        if path.exists() {
            return Self::from_file(path);
        }
        let identity = Self::generate();
        identity.save(path)?;
        Ok(identity)
    }

    /// Read and validate an identity file.
    pub fn from_file(path: &Path) -> MailResult<Self> {
        let data = std::fs::read(path)?;
        let file: IdentityFile = serde_json::from_slice(&data)
            .map_err(|e| MailError::Serialization(format!("identity file: {}", e)))?;

        let sign_sk = b64_decode_key(&file.sign_sk)?;
        let enc_sk = b64_decode_key(&file.enc_sk)?;
        let identity = Self {
            signing: SigningKey::from_bytes(&sign_sk),
            encryption: X25519StaticSecret::from(enc_sk),
        };

        // The public halves are derived; a mismatch means the file was edited
        if b64(identity.sign_public().as_ref()) != file.sign_pk {
            return Err(MailError::BadKey(
                "identity file signing key mismatch".to_string(),
            ));
        }
        if b64(identity.enc_public().as_ref()) != file.enc_pk {
            return Err(MailError::BadKey(
                "identity file encryption key mismatch".to_string(),
            ));
        }
        Ok(identity)
    }

    /// Persist the identity as JSON with owner-only permissions.
    pub fn save(&self, path: &Path) -> MailResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = IdentityFile {
            sign_sk: b64(&self.signing.to_bytes()),
            sign_pk: b64(self.sign_public().as_ref()),
            enc_sk: b64(&self.encryption.to_bytes()),
            enc_pk: b64(self.enc_public().as_ref()),
        };
        let data = serde_json::to_vec_pretty(&file)
            .map_err(|e| MailError::Serialization(e.to_string()))?;
        std::fs::write(path, data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// The Ed25519 verifying key bytes.
    pub fn sign_public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The X25519 public key bytes.
    pub fn enc_public(&self) -> [u8; 32] {
        X25519PublicKey::from(&self.encryption).to_bytes()
    }

    /// This node's fingerprint.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.sign_public())
    }

    /// Sign arbitrary bytes, returning a detached 64-byte signature.
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(data).to_bytes()
    }

    /// Open a sealed box addressed to this identity.
    pub fn open(&self, ciphertext: &[u8]) -> MailResult<Vec<u8>> {
        if ciphertext.len() < SEAL_OVERHEAD {
            return Err(MailError::DecryptFailed);
        }

        let mut eph_pk = [0u8; 32];
        eph_pk.copy_from_slice(&ciphertext[..32]);
        let nonce = Nonce::from_slice(&ciphertext[32..32 + NONCE_SIZE]);
        let sealed = &ciphertext[32 + NONCE_SIZE..];

        let shared = self
            .encryption
            .diffie_hellman(&X25519PublicKey::from(eph_pk));
        let key = derive_seal_key(shared.as_bytes(), &eph_pk, &self.enc_public());

        let cipher = ChaCha20Poly1305::new(&key.into());
        cipher
            .decrypt(nonce, sealed)
            .map_err(|_| MailError::DecryptFailed)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .field("enc_pk", &b64(self.enc_public().as_ref()))
            .finish_non_exhaustive()
    }
}

/// Compute the fingerprint of a signing public key: the first 16 characters
/// of its URL-safe base64 encoding.
pub fn fingerprint(sign_pk: &[u8; 32]) -> String {
    let mut encoded = b64(sign_pk);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}

/// Verify a detached Ed25519 signature.
pub fn verify(sign_pk: &[u8; 32], data: &[u8], signature: &[u8]) -> MailResult<()> {
    let key = VerifyingKey::from_bytes(sign_pk)
        .map_err(|_| MailError::BadKey("invalid Ed25519 public key".to_string()))?;
    let sig_bytes: [u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| MailError::BadSignature)?;
    key.verify(data, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| MailError::BadSignature)
}

/// Seal plaintext to a recipient's X25519 public key.
pub fn seal(enc_pk: &[u8; 32], plaintext: &[u8]) -> MailResult<Vec<u8>> {
    let mut eph_seed = [0u8; 32];
    getrandom::getrandom(&mut eph_seed)
        .map_err(|e| MailError::BadKey(format!("ephemeral key generation failed: {}", e)))?;
    let eph_secret = X25519StaticSecret::from(eph_seed);
    let eph_public = X25519PublicKey::from(&eph_secret).to_bytes();

    let shared = eph_secret.diffie_hellman(&X25519PublicKey::from(*enc_pk));
    let key = derive_seal_key(shared.as_bytes(), &eph_public, enc_pk);

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);

    let cipher = ChaCha20Poly1305::new(&key.into());
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| MailError::BadKey(format!("encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
    out.extend_from_slice(&eph_public);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Derive the sealed-box content key from the X25519 shared secret.
///
/// Both public keys are mixed into the IKM so a ciphertext cannot be
/// re-targeted at another recipient.
fn derive_seal_key(shared: &[u8], eph_pk: &[u8; 32], recipient_pk: &[u8; 32]) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(shared.len() + 64);
    ikm.extend_from_slice(shared);
    ikm.extend_from_slice(eph_pk);
    ikm.extend_from_slice(recipient_pk);

    let hkdf = Hkdf::<Sha256>::new(None, &ikm);
    let mut output = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut output)
        .expect("HKDF expand with 32-byte output cannot fail");
    output
}
