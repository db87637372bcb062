//! Messaging service: lifecycle, status and the glue between the transport,
//! the rate governor, the correlation cache, history and the event hub.

mod builder;
mod inbound;
mod outbound;

pub use builder::MessagingServiceBuilder;
pub use outbound::{ContactData, LocationData, MediaData, MessageRequest, OutgoingMessage};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};

use crate::cache::CorrelationCache;
use crate::cancel::CancellationToken;
use crate::clock::{to_chrono, Clock};
use crate::config::{CacheConfig, LifecycleConfig};
use crate::error::{CourierError, Result};
use crate::events::{Event, EventHub, EventKind, PublishOutcome};
use crate::history::{ChatHistoryQuery, ChatHistoryResult, HistoryStore};
use crate::rate_limit::{RateGovernor, RateLimitConfig, RateLimitStats};
use crate::transport::{
    InboundMessage, MessagingTransport, TransportEventReceiver, TransportEventSender,
    TransportProvider,
};

/// Snapshot returned by [`MessagingService::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub connected: bool,
    pub has_session: bool,
    pub running: bool,
    pub pairing: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Most recent pairing code issued by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingCode {
    pub code: String,
    pub issued_at: DateTime<Local>,
}

#[derive(Debug)]
struct Lifecycle {
    running: bool,
    pairing: bool,
    /// Cancelled on shutdown, replaced on start.
    token: CancellationToken,
    pairing_code: Option<PairingCode>,
}

/// The messaging service.
///
/// Owns one transport at a time (replaced on reset) and shares the
/// process-wide [`EventHub`] with the RPC layer.
#[derive(Debug)]
pub struct MessagingService {
    provider: Arc<dyn TransportProvider>,
    transport: RwLock<Arc<dyn MessagingTransport>>,
    transport_events: TransportEventSender,
    governor: RateGovernor,
    cache: CorrelationCache<Arc<InboundMessage>>,
    history: Arc<dyn HistoryStore>,
    hub: Arc<EventHub>,
    clock: Arc<dyn Clock>,
    lifecycle: Mutex<Lifecycle>,
    shutting_down: AtomicBool,
}

impl MessagingService {
    /// Start configuring a service around `provider`.
    pub fn builder(provider: Arc<dyn TransportProvider>) -> MessagingServiceBuilder {
        MessagingServiceBuilder::new(provider)
    }

    fn assemble(
        provider: Arc<dyn TransportProvider>,
        transport: Arc<dyn MessagingTransport>,
        transport_events: TransportEventSender,
        rate_limit: RateLimitConfig,
        clock: Arc<dyn Clock>,
        history: Arc<dyn HistoryStore>,
        hub: Arc<EventHub>,
    ) -> Self {
        Self {
            provider,
            transport: RwLock::new(transport),
            transport_events,
            governor: RateGovernor::new(rate_limit, Arc::clone(&clock)),
            cache: CorrelationCache::new(CacheConfig::MESSAGE_CACHE_CAPACITY),
            history,
            hub,
            clock,
            lifecycle: Mutex::new(Lifecycle {
                running: false,
                pairing: false,
                token: CancellationToken::new(),
                pairing_code: None,
            }),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Route transport events into [`handle_transport_event`](Self::handle_transport_event).
    ///
    /// The pump holds only a weak reference and ends when the service is dropped.
    fn spawn_transport_pump(service: &Arc<Self>, mut events: TransportEventReceiver) {
        let service: Weak<Self> = Arc::downgrade(service);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(service) = service.upgrade() else {
                    break;
                };
                service.handle_transport_event(event);
            }
            debug!("Transport event pump stopped");
        });
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Connect with the stored session, or begin pairing when there is none.
    pub async fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.running {
                warn!("Messaging service already running");
                return Ok(());
            }
            lifecycle.running = true;
            lifecycle.token = CancellationToken::new();
        }
        self.shutting_down.store(false, Ordering::SeqCst);

        let transport = self.transport();
        let result = if transport.device_id().is_none() {
            info!("No session found, starting pairing");
            self.lifecycle().pairing = true;
            transport.start_pairing().await
        } else {
            transport.connect().await
        };

        if let Err(e) = result {
            let mut lifecycle = self.lifecycle();
            lifecycle.running = false;
            lifecycle.pairing = false;
            warn!("Messaging service failed to start: {}", e);
            return Err(e);
        }

        info!("Messaging service started");
        Ok(())
    }

    /// Stop the service. Idempotent.
    ///
    /// Pending sends waiting on the rate governor are cancelled, the transport
    /// is disconnected, and after a short grace period the event queue is
    /// drained. The queue itself stays open for the next start.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Messaging service already shut down");
            return;
        }

        {
            let mut lifecycle = self.lifecycle();
            lifecycle.running = false;
            lifecycle.pairing = false;
            lifecycle.token.cancel();
        }

        self.transport().disconnect().await;
        self.clock.sleep(LifecycleConfig::SHUTDOWN_GRACE).await;

        let drained = self.hub.drain();
        info!(
            "Messaging service stopped ({} pending events drained)",
            drained
        );
    }

    /// Log out, wipe the session, history and cache, and create a fresh
    /// transport. The event hub is reused.
    pub async fn reset(&self) -> Result<()> {
        info!("Resetting messaging service");
        let transport = self.transport();

        if transport.is_logged_in() {
            if let Err(e) = transport.logout().await {
                warn!("Logout during reset failed: {}", e);
            }
        }

        self.shutdown().await;

        if let Err(e) = transport.delete_session().await {
            warn!("Failed to delete session: {}", e);
        }

        let history = Arc::clone(&self.history);
        match tokio::task::spawn_blocking(move || history.clear()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to clear message history: {}", e),
            Err(e) => warn!("History clear task failed: {}", e),
        }

        self.cache.clear();
        self.clear_pairing_code();
        self.clock.sleep(LifecycleConfig::SHUTDOWN_GRACE).await;

        let fresh = self.provider.create(self.transport_events.clone())?;
        *self
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner) = fresh;

        info!("Messaging service reset complete");
        Ok(())
    }

    /// Forget the current pairing code and reset.
    pub async fn restart(&self) -> Result<()> {
        self.clear_pairing_code();
        self.reset().await?;
        self.start().await
    }

    // ========================================
    // Status
    // ========================================

    pub fn status(&self) -> ServiceStatus {
        let transport = self.transport();
        let lifecycle = self.lifecycle();
        let device_id = transport.device_id();
        ServiceStatus {
            connected: transport.is_connected(),
            has_session: device_id.is_some(),
            running: lifecycle.running,
            pairing: lifecycle.pairing,
            timestamp: Utc::now(),
            device_id,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle().running
    }

    /// Flags and counters for troubleshooting.
    pub fn diagnostics(&self) -> Value {
        let transport = self.transport();
        let (running, pairing, has_code) = {
            let lifecycle = self.lifecycle();
            (
                lifecycle.running,
                lifecycle.pairing,
                lifecycle.pairing_code.is_some(),
            )
        };

        json!({
            "service": {
                "running": running,
                "pairing": pairing,
                "shutting_down": self.shutting_down.load(Ordering::SeqCst),
                "has_pairing_code": has_code,
            },
            "transport": {
                "connected": transport.is_connected(),
                "logged_in": transport.is_logged_in(),
                "has_session": transport.device_id().is_some(),
                "device_id": transport.device_id(),
            },
            "events": {
                "queue": self.hub.stats(),
                "subscribers": self.hub.subscriber_count(),
                "forwarded": self.hub.forwarded_count(),
            },
            "message_cache": self.cache.stats(),
            "rate_limit": {
                "enabled": self.governor.config().enabled,
                "paused": self.governor.is_paused(),
            },
            "timestamp": Utc::now(),
        })
    }

    /// The current pairing code, if one was issued within the last minute.
    pub fn current_pairing_code(&self) -> Result<PairingCode> {
        let lifecycle = self.lifecycle();
        let code = lifecycle
            .pairing_code
            .as_ref()
            .ok_or(CourierError::NoPairingCode)?;
        let age = self.clock.now() - code.issued_at;
        if age > to_chrono(LifecycleConfig::PAIRING_CODE_TTL) {
            return Err(CourierError::NoPairingCode);
        }
        Ok(code.clone())
    }

    fn set_pairing_code(&self, code: String) -> PairingCode {
        let pairing_code = PairingCode {
            code,
            issued_at: self.clock.now(),
        };
        let mut lifecycle = self.lifecycle();
        lifecycle.pairing = true;
        lifecycle.pairing_code = Some(pairing_code.clone());
        pairing_code
    }

    fn clear_pairing_code(&self) {
        self.lifecycle().pairing_code = None;
    }

    fn finish_pairing(&self) {
        let mut lifecycle = self.lifecycle();
        lifecycle.pairing = false;
        lifecycle.pairing_code = None;
    }

    // ========================================
    // Rate limiting
    // ========================================

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        self.governor.config()
    }

    /// Replace the rate-limit policy; returns the normalized config applied.
    pub fn set_rate_limit_config(&self, config: RateLimitConfig) -> RateLimitConfig {
        self.governor.set_config(config)
    }

    pub fn rate_limit_stats(&self) -> RateLimitStats {
        self.governor.stats()
    }

    pub fn unpause_rate_limiting(&self) -> RateLimitStats {
        self.governor.unpause();
        self.governor.stats()
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    // ========================================
    // History
    // ========================================

    pub async fn chat_history(&self, query: ChatHistoryQuery) -> Result<ChatHistoryResult> {
        let history = Arc::clone(&self.history);
        tokio::task::spawn_blocking(move || history.chat_history(&query))
            .await
            .map_err(|e| CourierError::Other(format!("history query task failed: {e}")))?
    }

    /// Chat id for a phone, group or raw chat target, as recorded in history.
    pub fn resolve_chat_id(&self, target: &crate::transport::ChatTarget) -> String {
        self.transport().resolve_chat_id(target)
    }

    // ========================================
    // Events
    // ========================================

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Publish an event unless the service is shutting down.
    ///
    /// Returns true when the event was queued.
    pub fn emit(&self, kind: EventKind, data: Value) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!("Service shutting down, not publishing {} event", kind);
            return false;
        }
        self.hub.publish(Event::new(kind, data)) == PublishOutcome::Queued
    }

    pub fn message_cache_len(&self) -> usize {
        self.cache.len()
    }

    // ========================================
    // Internals
    // ========================================

    /// The transport currently in use.
    pub fn transport(&self) -> Arc<dyn MessagingTransport> {
        Arc::clone(&self.transport.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn lifecycle_token(&self) -> CancellationToken {
        self.lifecycle().token.clone()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
