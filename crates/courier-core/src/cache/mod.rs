//! In-memory lookup of recently received messages.
//!
//! Inbound messages are remembered by identifier so that a later attachment
//! download can find the message that carried the attachment. The cache is
//! bounded and evicts in arrival order; it is not an LRU.

mod correlation;

pub use correlation::{CorrelationCache, CorrelationCacheStats};
