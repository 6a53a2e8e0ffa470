use thiserror::Error;

/// Message-layer failures. All of these are non-fatal: the caller rejects the
/// offending message and keeps running.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecurityError {
    /// HMAC verification failed.
    #[error("invalid_mac: HMAC verification failed")]
    InvalidMac,
    /// Nonce already seen in the recent-nonce set.
    #[error("replay_detected: nonce {0} already seen")]
    ReplayDetected(u32),
    /// Nonce outside the acceptable window (too old or too far ahead).
    #[error("nonce_too_old: nonce {nonce} rejected (last accepted {last_received})")]
    NonceTooOld { nonce: u32, last_received: u32 },
    /// Encryption, decryption, or payload decoding failed.
    #[error("encryption_error: {0}")]
    EncryptionError(String),
    /// Required envelope fields missing or unparseable.
    #[error("invalid_format: {0}")]
    InvalidFormat(String),
    /// Pre-shared key malformed (wrong length or not hex).
    #[error("key_error: {0}")]
    KeyError(String),
}

impl SecurityError {
    /// Short status token matching the wire/reporting vocabulary.
    pub fn status(&self) -> &'static str {
        match self {
            SecurityError::InvalidMac => "invalid_mac",
            SecurityError::ReplayDetected(_) => "replay_detected",
            SecurityError::NonceTooOld { .. } => "nonce_too_old",
            SecurityError::EncryptionError(_) => "encryption_error",
            SecurityError::InvalidFormat(_) => "invalid_format",
            SecurityError::KeyError(_) => "key_error",
        }
    }
}

/// Cloud transport failures. A failed chunk fetch is retried on a later tick;
/// a failed status post is logged and dropped.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("unexpected status code {0}")]
    BadStatus(u16),
}

/// Update-layer failures. `CorruptState` and `Platform` are fatal for the
/// in-flight update; everything else leaves the state machine able to retry.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("no valid manifest")]
    NoManifest,
    #[error("corrupted update state: {0}")]
    CorruptState(String),
    #[error("platform operation failed: {0}")]
    Platform(String),
    #[error("firmware not verified")]
    NotVerified,
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error(transparent)]
    Transport(#[from] TransportError),
}
