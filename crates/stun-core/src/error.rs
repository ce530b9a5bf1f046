//! Error types for the STUN layer.

use thiserror::Error;

/// Result type alias for STUN operations.
pub type Result<T> = std::result::Result<T, StunError>;

/// Errors produced while encoding or decoding STUN wire data.
///
/// Codec errors are always local and recoverable: the right response to any
/// of them is to drop the offending datagram.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer is too short for the STUN header or a declared length.
    #[error("truncated buffer: need {needed} bytes, got {actual}")]
    TruncatedBuffer { needed: usize, actual: usize },

    /// The magic cookie field does not match 0x2112A442.
    #[error("bad magic cookie: 0x{0:08x}")]
    BadMagicCookie(u32),

    /// The first two bits of the message are not zero.
    #[error("not a STUN message (leading bits set)")]
    NotStun,

    /// The declared message length disagrees with the buffer.
    #[error("message length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// The declared message length is not a multiple of 4.
    #[error("message length {0} is not a multiple of 4")]
    UnalignedLength(usize),

    /// An attribute's declared length runs past the end of the buffer.
    #[error("attribute 0x{attr_type:04x} overruns buffer: declared {declared}, remaining {remaining}")]
    AttributeOverrun {
        attr_type: u16,
        declared: usize,
        remaining: usize,
    },

    /// An attribute in the comprehension-required range (< 0x8000) that the
    /// decoder does not understand. Decode must fail; unknown optional
    /// attributes are preserved as opaque instead.
    #[error("unknown comprehension-required attribute 0x{0:04x}")]
    UnknownRequiredAttribute(u16),

    /// An attribute's value is malformed for its type.
    #[error("bad {what} attribute: {details}")]
    BadAttribute {
        what: &'static str,
        details: String,
    },

    /// FINGERPRINT was present and did not match the message contents.
    #[error("FINGERPRINT mismatch")]
    BadFingerprint,

    /// An attribute appeared after MESSAGE-INTEGRITY that is not FINGERPRINT.
    #[error("attribute 0x{0:04x} after MESSAGE-INTEGRITY")]
    AttributeAfterIntegrity(u16),
}

/// Top-level error type for the STUN transaction and session layers.
#[derive(Error, Debug)]
pub enum StunError {
    /// Malformed wire data; drop the datagram.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No response within the retransmit budget.
    #[error("transaction timed out")]
    TransactionTimeout,

    /// The peer answered with an error-class response.
    #[error("server error {code}: {reason}")]
    ServerError { code: u16, reason: String },

    /// The transaction was cancelled, or its session was closed, before a
    /// terminal response arrived.
    #[error("transaction cancelled")]
    Cancelled,

    /// Too many concurrent transactions; new work rejected.
    #[error("transaction limit reached ({0})")]
    ResourceExhausted(usize),

    /// MESSAGE-INTEGRITY did not verify against the expected key.
    #[error("message integrity mismatch")]
    IntegrityMismatch,

    /// Operation not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Underlying socket failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl StunError {
    /// The STUN error code carried by an error-class response, if any.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            StunError::ServerError { code, .. } => Some(*code),
            _ => None,
        }
    }
}
