use crate::session::SessionState;

use thiserror::Error;
use uuid::Uuid;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("veritally: {0}")]
    Crypto(#[from] CryptoError),

    #[error("veritally: election {0} not found")]
    ElectionNotFound(Uuid),

    #[error("veritally: tallying session for election {0} not found")]
    SessionNotFound(Uuid),

    #[error("veritally: result for election {0} not found")]
    ResultNotFound(Uuid),

    #[error("veritally: trustee with index {0} not found")]
    TrusteeNotFound(u8),

    #[error("veritally: trustee {0} is not active")]
    TrusteeInactive(u8),

    #[error("veritally: tallying session already exists for election {0}")]
    SessionExists(Uuid),

    #[error("veritally: wrong session state: expected {expected}, found {found}")]
    WrongState {
        expected: SessionState,
        found: SessionState,
    },

    #[error("veritally: invalid election state transition")]
    WrongElectionState,

    #[error("veritally: election must list at least one candidate")]
    NoCandidates,

    #[error("veritally: no ballots to tally")]
    NoBallots,

    #[error("veritally: duplicate ballot nonce")]
    DuplicateNonce,

    #[error("veritally: ballots are frozen for this election")]
    BallotsFrozen,

    #[error("veritally: ballot has {found} choices but the election has {expected} candidates")]
    BallotArityMismatch { expected: usize, found: usize },

    #[error("veritally: duplicate partial decryption from trustee {0}")]
    DuplicatePartialDecryption(u8),

    #[error("veritally: partial decryption proof failed to verify for trustee {0}")]
    InvalidPartialDecryption(u8),

    #[error("veritally: not enough verified partial decryptions: need {needed}, found {found}")]
    TooFewTrustees { needed: u8, found: u8 },

    #[error("veritally: result already published")]
    AlreadyPublished,

    #[error("veritally: invalid key size {0} (must be an even number of bits, at least 64)")]
    InvalidKeySize(usize),

    #[error("veritally: plaintext out of range (m must satisfy 0 <= m < n)")]
    PlaintextOutOfRange,

    #[error("veritally: ciphertext out of range (c must satisfy 0 <= c < n^2)")]
    CiphertextOutOfRange,

    #[error("veritally: threshold is invalid for number of trustees")]
    InvalidThreshold,

    #[error("veritally: trustee index {0} is outside 1..=total_trustees")]
    InvalidTrusteeIndex(u8),

    #[error("veritally: key share decryption failed")]
    ShareDecryption,

    #[error("veritally: storage error: {0}")]
    Storage(String),

    #[error("veritally: deadline expired during {0}")]
    DeadlineExpired(&'static str),
}

/// Failures inside the cryptographic core.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed after {0} attempts")]
    KeyGenFailed(u32),

    #[error("share issuance failed: {0}")]
    ShareIssuance(&'static str),

    #[error("combine failed: {0}")]
    Combine(&'static str),

    #[error("combined plaintext exceeds the expected bound")]
    PlaintextOverflow,
}

/// The broad kind of an [`Error`], for callers that map failures onto
/// a wire surface (400 for domain, 409 for state, and so on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Inputs out of range; never retried.
    Domain,
    /// Operation requested in the wrong state; caller must re-read state.
    State,
    /// Key generation, proof verification or combine failure.
    Crypto,
    /// Persistence unavailable.
    Storage,
    /// Deadline expired; the operation was not attempted.
    Timeout,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Crypto(_)
            | Error::InvalidPartialDecryption(_)
            | Error::ShareDecryption => ErrorKind::Crypto,
            Error::SessionExists(_)
            | Error::WrongState { .. }
            | Error::WrongElectionState
            | Error::BallotsFrozen
            | Error::DuplicatePartialDecryption(_)
            | Error::TooFewTrustees { .. }
            | Error::AlreadyPublished => ErrorKind::State,
            Error::Storage(_) => ErrorKind::Storage,
            Error::DeadlineExpired(_) => ErrorKind::Timeout,
            _ => ErrorKind::Domain,
        }
    }
}
