use citizencard_apdu_core::{StatusWord, TransportError};
use iso7816_tlv::TlvError;

use crate::types::{DigestAlgorithm, PaddingScheme};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No reader is attached to the system
    #[error("no card reader found")]
    ReaderNotFound,

    /// Readers exist but none holds a card
    #[error("no card present in any reader")]
    CardNotPresent,

    /// At least one card was seen but none matched the driver registry
    #[error("card not supported")]
    UnknownCard,

    /// The user dismissed the multi-card selection dialog
    #[error("card selection cancelled")]
    SelectionCancelled,

    /// A card command completed with a status word the driver did not expect
    #[error("unexpected status word {0}")]
    UnexpectedStatus(StatusWord),

    /// No digest-prefix entry exists for the requested algorithm
    #[error("unknown digest algorithm {0:?}")]
    UnknownDigestAlgorithm(DigestAlgorithm),

    /// No algorithm-id mapping exists for the requested digest/padding pair
    #[error("unsupported algorithm: {digest:?} with {padding:?}")]
    UnsupportedAlgorithm {
        /// Requested digest algorithm
        digest: DigestAlgorithm,
        /// Requested padding scheme
        padding: PaddingScheme,
    },

    /// The PIN-entry timer fired before the user entered anything
    #[error("PIN entry timed out")]
    PinTimedOut,

    /// The user cancelled PIN entry
    #[error("PIN entry cancelled")]
    PinEntryCancelled,

    /// The PIN has no tries remaining
    #[error("PIN is blocked")]
    PinBlocked,

    /// Structurally invalid data, on the card or supplied by the caller
    #[error("invalid data: {0}")]
    InvalidData(&'static str),

    /// Transport-level fault
    #[error("protocol error")]
    Protocol(#[from] TransportError),

    /// TLV parsing fault in card-supplied structures
    #[error("TLV error: {0}")]
    Tlv(TlvError),
}

impl From<TlvError> for Error {
    fn from(error: TlvError) -> Self {
        Self::Tlv(error)
    }
}
