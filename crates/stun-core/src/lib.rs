//! STUN protocol engine for the rnat stack.
//!
//! Three layers, leaves first:
//!
//! - [`message`] / [`attr`]: the wire codec. No I/O, no state.
//! - [`transaction`]: one retransmitting request/response exchange.
//! - [`session`]: a STUN endpoint on one UDP socket, multiplexing
//!   transactions and handing unsolicited traffic to an injected handler.
//!
//! The TURN client and the ICE agent build on the session layer.

pub mod attr;
pub mod auth;
pub mod error;
pub mod message;
pub mod session;
pub mod transaction;

pub use attr::{StunAttribute, StunAttributeType};
pub use auth::{long_term_key, short_term_key, Credentials};
pub use error::{CodecError, Result, StunError};
pub use message::{
    is_stun, stream_frame_len, verify_integrity, DecodeOptions, MessageClass, Method,
    StunMessage, TransactionId, HEADER_SIZE, MAGIC_COOKIE,
};
pub use session::{bind_session, BindingResponder, StunConfig, StunSession, StunSessionHandler};
pub use transaction::{Canceller, RequestHandle, TransactionResult};
