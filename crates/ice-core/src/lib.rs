//! ICE connectivity establishment for the rnat stack (RFC 8445).
//!
//! The [`IceAgent`] composes the STUN session and TURN client layers:
//! it gathers host, server-reflexive and relayed candidates, pairs them
//! with the peer's, runs paced connectivity checks authenticated with
//! the exchanged ufrag/pwd, and nominates one pair per component.
//! Candidates and credentials travel through an external signaling
//! collaborator in the SDP candidate-line format.

pub mod agent;
pub mod candidate;
pub mod checklist;
pub mod config;
pub mod error;

pub use agent::{IceAgent, IceEvent, IceState};
pub use candidate::{compute_priority, Candidate, CandidateType};
pub use checklist::{pair_priority, CandidatePair, CheckList, PairState};
pub use config::{IceConfig, IceCredentials, IceRole, NominationMode, TurnServerConfig};
pub use error::{Error, Result};
