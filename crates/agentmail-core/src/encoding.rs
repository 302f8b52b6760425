//! URL-safe base64 helpers for keys, signatures and ciphertext.
//!
//! All binary fields on the wire use URL-safe base64 without padding
//! (alphabet `[A-Za-z0-9\-_]`), matching the fingerprint rule.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{MailError, MailResult};

/// Encode bytes as URL-safe base64 without padding.
pub fn b64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode URL-safe base64 without padding.
pub fn b64_decode(s: &str) -> MailResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| MailError::Serialization(format!("invalid base64: {}", e)))
}

/// Decode URL-safe base64 into a fixed 32-byte array (key material).
pub fn b64_decode_key(s: &str) -> MailResult<[u8; 32]> {
    let bytes = b64_decode(s)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| MailError::BadKey(format!("expected 32 bytes, got {}", bytes.len())))
}

/// Serde adapter: `Vec<u8>` as a URL-safe base64 string.
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::b64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::b64_decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `[u8; 32]` (public keys) as a URL-safe base64 string.
pub mod base64_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::b64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        super::b64_decode_key(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let data = [0u8, 1, 2, 254, 255];
        let encoded = b64(&data);
        assert_eq!(b64_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_alphabet_is_url_safe() {
        // 0xfb 0xff forces '+' and '/' in the standard alphabet
        let encoded = b64(&[0xfb, 0xff, 0xfe, 0xfb, 0xff, 0xfe]);
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('='));
    }

    #[test]
    fn test_decode_key_rejects_wrong_length() {
        let short = b64(&[1u8; 16]);
        assert!(matches!(
            b64_decode_key(&short),
            Err(crate::error::MailError::BadKey(_))
        ));
    }
}
