//! Error types for the ICE layer.

use thiserror::Error;

use rnat_stun_core::StunError;

/// Result type alias for ICE operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the ICE agent.
#[derive(Error, Debug)]
pub enum Error {
    /// A STUN operation underneath the agent failed.
    #[error("stun error: {0}")]
    Stun(#[from] StunError),

    /// A candidate line or candidate field could not be parsed.
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    /// The operation is not valid in the agent's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Gathering produced no usable candidate for a component.
    #[error("no candidates for component {0}")]
    NoCandidates(u8),

    /// Every pair in a component's check list failed.
    #[error("connectivity checks failed: {0}")]
    ChecksFailed(String),

    /// Underlying socket failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}
