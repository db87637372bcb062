//! Centralized configuration for Courier.
//!
//! Fixed limits and defaults live here as associated constants. Values that
//! operators change at runtime (the rate-limit policy, listen addresses) are
//! carried by their own types and seeded from these constants.

use std::time::Duration;

/// Server-level defaults used by the RPC binary.
pub struct ServerConfig;

impl ServerConfig {
    pub const APP_NAME: &'static str = "Courier";
    pub const DEFAULT_HOST: &'static str = "0.0.0.0";
    pub const DEFAULT_PORT: u16 = 9400;
    pub const WS_RPC_PATH: &'static str = "/ws/rpc";
    pub const HEALTH_PATH: &'static str = "/health";
    pub const MAX_FRAMED_CONNECTIONS: usize = 64;
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
}

/// Event queue and fan-out sizing.
pub struct EventConfig;

impl EventConfig {
    /// Capacity of the process-wide event queue.
    pub const QUEUE_CAPACITY: usize = 100;
    /// Per-subscriber buffer between the fan-out pump and a connection.
    pub const SUBSCRIBER_BUFFER: usize = 256;
    /// Prefix of every notification method name.
    pub const NOTIFICATION_PREFIX: &'static str = "event.";
}

/// Correlation cache sizing.
pub struct CacheConfig;

impl CacheConfig {
    pub const MESSAGE_CACHE_CAPACITY: usize = 100;
}

/// Fixed parameters of the rate governor and its default policy.
pub struct RateLimitDefaults;

impl RateLimitDefaults {
    pub const MIN_DELAY_MS: i64 = 3000;
    pub const MAX_DELAY_MS: i64 = 8000;
    pub const TYPING_DELAY_MS: i64 = 2000;
    pub const LINK_EXTRA_DELAY_MS: i64 = 5000;
    pub const MAX_MESSAGES_PER_MINUTE: i64 = 10;
    pub const MAX_MESSAGES_PER_HOUR: i64 = 60;
    pub const MAX_NEW_CONTACTS_PER_DAY: i64 = 20;
    pub const RESPONSE_RATE_THRESHOLD: f64 = 0.3;

    /// Sends required today before the low-response valve is evaluated.
    pub const MIN_SENDS_FOR_RESPONSE_RATE: u32 = 10;
    /// Slack added to a soft-limit wait so the oldest send has aged out.
    pub const WINDOW_SLACK: Duration = Duration::from_millis(100);
    pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);
    pub const HOUR_WINDOW: Duration = Duration::from_secs(3600);
}

/// Service lifecycle timing.
pub struct LifecycleConfig;

impl LifecycleConfig {
    /// Pause after disconnecting before the event queue is drained.
    pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);
    /// Pairing codes older than this are treated as absent.
    pub const PAIRING_CODE_TTL: Duration = Duration::from_secs(60);
}

/// Message history defaults.
pub struct HistoryConfig;

impl HistoryConfig {
    pub const DEFAULT_DB_PATH: &'static str = "data/courier.db";
    pub const DEFAULT_PAGE_SIZE: u32 = 50;
    pub const MAX_PAGE_SIZE: u32 = 500;
}
