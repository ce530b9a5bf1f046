//! TURN relay client for the rnat stack (RFC 8656).
//!
//! Builds on [`rnat_stun_core`]'s session layer: Allocate/Refresh/
//! CreatePermission/ChannelBind are ordinary authenticated STUN
//! transactions, relayed data travels as Send/Data indications or, once a
//! channel is bound, as compact ChannelData frames.

pub mod channel;
pub mod client;

pub use channel::{is_channel_data, ChannelData, CHANNEL_MAX, CHANNEL_MIN};
pub use client::{Allocation, TurnClient, TurnConfig, TurnEvent, TurnState};
