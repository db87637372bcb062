//! Courier Core - paced outbound messaging and event fan-out for one
//! messaging account.
//!
//! The crate sits between a messaging network (behind the
//! [`MessagingTransport`] port) and local clients. Outbound sends go through
//! the [`RateGovernor`] before they reach the network; inbound messages are
//! remembered in a bounded [`CorrelationCache`] so their attachments can be
//! fetched later, and every notable happening is published on the shared
//! [`EventHub`]. The RPC layer lives in the `courier-rpc` crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_core::{LoopbackProvider, MessageRequest, MessagingService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> courier_core::Result<()> {
//!     let service = MessagingService::builder(Arc::new(LoopbackProvider::new()))
//!         .build()
//!         .await?;
//!     service.start().await?;
//!
//!     let sent = service
//!         .send_message(
//!             MessageRequest {
//!                 phone: Some("15550001".into()),
//!                 message: "hello".into(),
//!                 ..MessageRequest::default()
//!             },
//!             None,
//!         )
//!         .await?;
//!     println!("Sent {}", sent.id);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod rate_limit;
pub mod service;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use cache::{CorrelationCache, CorrelationCacheStats};
pub use cancel::CancellationToken;
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{CourierError, Result};
pub use events::{Event, EventHub, EventKind, EventQueue, EventSubscription, PublishOutcome};
pub use history::{ChatHistoryQuery, ChatHistoryResult, HistoryStore, MessageRecord, SqliteHistoryStore};
pub use rate_limit::{AdmitOptions, RateGovernor, RateLimitConfig, RateLimitStats, SendPermit};
pub use service::{
    MediaData, MessageRequest, MessagingService, MessagingServiceBuilder, PairingCode,
    ServiceStatus,
};
pub use transport::{
    Attachment, ChatPresence, ChatTarget, LoopbackProvider, LoopbackTransport, MessagingTransport,
    Presence, PresenceMedia, SentMessage, TransportEvent, TransportProvider,
};
