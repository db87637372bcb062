//! Builder for configuring MessagingService initialization.

use std::sync::Arc;
use tokio::sync::mpsc;

use super::MessagingService;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::events::EventHub;
use crate::history::{HistoryStore, SqliteHistoryStore};
use crate::rate_limit::RateLimitConfig;
use crate::transport::TransportProvider;

/// Builder for [`MessagingService`].
///
/// # Example
///
/// ```rust,ignore
/// use courier_core::{MessagingService, LoopbackProvider, SqliteHistoryStore};
/// use std::sync::Arc;
///
/// let service = MessagingService::builder(Arc::new(LoopbackProvider::new()))
///     .history(Arc::new(SqliteHistoryStore::open("data/courier.db")?))
///     .build()
///     .await?;
/// service.start().await?;
/// ```
pub struct MessagingServiceBuilder {
    provider: Arc<dyn TransportProvider>,
    clock: Arc<dyn Clock>,
    rate_limit: RateLimitConfig,
    history: Option<Arc<dyn HistoryStore>>,
    hub: Option<Arc<EventHub>>,
}

impl MessagingServiceBuilder {
    pub fn new(provider: Arc<dyn TransportProvider>) -> Self {
        Self {
            provider,
            clock: Arc::new(SystemClock),
            rate_limit: RateLimitConfig::default(),
            history: None,
            hub: None,
        }
    }

    /// Time source for rate limiting, grace periods and pairing-code expiry.
    ///
    /// Default: [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Initial rate-limit policy.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    /// History backend. Default: an in-memory SQLite store.
    pub fn history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Share an existing event hub, e.g. one the RPC server already serves.
    ///
    /// Default: a new hub with the standard queue capacity.
    pub fn hub(mut self, hub: Arc<EventHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Create the transport, start the event pumps and return the service.
    ///
    /// The service is built stopped; call [`MessagingService::start`].
    pub async fn build(self) -> Result<Arc<MessagingService>> {
        let history = match self.history {
            Some(history) => history,
            None => Arc::new(SqliteHistoryStore::in_memory()?),
        };
        let hub = self.hub.unwrap_or_else(EventHub::new);
        hub.spawn_pump();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self.provider.create(events_tx.clone())?;

        let service = Arc::new(MessagingService::assemble(
            self.provider,
            transport,
            events_tx,
            self.rate_limit,
            self.clock,
            history,
            hub,
        ));
        MessagingService::spawn_transport_pump(&service, events_rx);
        Ok(service)
    }
}
