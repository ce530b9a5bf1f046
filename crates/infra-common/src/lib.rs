//! Shared infrastructure for the rnat stack.
//!
//! This crate carries the pieces every protocol crate leans on but none owns:
//! logging setup and the timer substrate. Higher layers (STUN sessions, the
//! TURN client, the ICE agent) construct their own [`timer::TimerQueue`]
//! instances and register timers against them; nothing in here is a process
//! global.

pub mod logging;
pub mod timer;

pub use logging::{init_logging, LoggingConfig};
pub use timer::{RetransmitProfile, TimerHandle, TimerQueue};
