//! Outbound rate governor.
//!
//! Every send is admitted against a sliding window of recent sends:
//! - soft limits (per-minute, per-hour) make the caller wait until the window
//!   frees up
//! - hard limits (new contacts per day, a paused governor, the low-response
//!   valve) fail immediately
//!
//! After admission the caller applies a randomized pacing delay and an
//! optional typing indicator before handing the message to the transport.

mod config;
mod governor;
mod state;

pub use config::RateLimitConfig;
pub use governor::{AdmitOptions, RateGovernor, SendPermit};
pub use state::RateLimitStats;
