//! Error types for AgentMail

use thiserror::Error;

/// Main error type for AgentMail operations
#[derive(Error, Debug)]
pub enum MailError {
    /// Envelope signature did not verify against the claimed sender key
    #[error("Signature verification failed")]
    BadSignature,

    /// A key had the wrong length or could not be decoded
    #[error("Bad key material: {0}")]
    BadKey(String),

    /// Sealed-box decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed")]
    DecryptFailed,

    /// An update would overwrite the pinned signing key for a known fingerprint
    #[error("Peer key conflict for fingerprint {fp}")]
    PeerConflict { fp: String },

    /// Resolution returned a different fingerprint than the one pinned for a name
    #[error("Identity conflict for name {name}: pinned {pinned}, resolved {resolved}")]
    IdentityConflict {
        name: String,
        pinned: String,
        resolved: String,
    },

    /// Recipient could not be resolved locally or through the relay
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    /// Address string could not be parsed as `name@host`
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Envelope or payload failed structural validation
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Envelope protocol version not supported
    #[error("Envelope version {0} is not supported")]
    VersionUnsupported(u32),

    /// Network-level failure reaching a peer or the relay (retried by the router)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The relay answered with a non-success HTTP status
    #[error("Relay error: HTTP {status}: {message}")]
    Relay { status: u16, message: String },

    /// Mailbox store failure
    #[error("Mailbox error: {0}")]
    Mailbox(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// mDNS advertisement or browsing failure
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Invalid node configuration
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailError {
    /// Whether the router should absorb this error and retry via the outbox.
    ///
    /// Transport failures and relay 5xx are retryable; crypto, conflict and
    /// relay 4xx failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            MailError::Transport(_) => true,
            MailError::Relay { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type alias using MailError
pub type MailResult<T> = Result<T, MailError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MailError::UnknownRecipient("bob@bob.local".to_string());
        assert_eq!(format!("{}", err), "Unknown recipient: bob@bob.local");
    }

    #[test]
    fn test_retryable_classes() {
        assert!(MailError::Transport("connection refused".into()).is_retryable());
        assert!(MailError::Relay {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!MailError::Relay {
            status: 404,
            message: "not found".into()
        }
        .is_retryable());
        assert!(!MailError::BadSignature.is_retryable());
        assert!(!MailError::PeerConflict { fp: "abc".into() }.is_retryable());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MailError = io_err.into();
        assert!(matches!(err, MailError::Io(_)));
    }
}
