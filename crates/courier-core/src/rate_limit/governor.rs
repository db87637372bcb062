//! Admission control and pacing for outbound sends.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use super::config::RateLimitConfig;
use super::state::{Admission, RateLimitStats, RateState};
use crate::cancel::CancellationToken;
use crate::clock::{Clock, SystemClock};
use crate::error::{CourierError, Result};
use crate::transport::{ChatPresence, ChatTarget, MessagingTransport, PresenceMedia};

/// Bounds on how long [`RateGovernor::admit_with`] may wait.
#[derive(Debug, Clone, Default)]
pub struct AdmitOptions {
    /// Total time the caller is willing to wait across all soft limits.
    pub max_wait: Option<Duration>,
    /// Abort the wait when this token is cancelled.
    pub cancel: Option<CancellationToken>,
}

impl AdmitOptions {
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug)]
struct GovernorInner {
    config: RateLimitConfig,
    state: RateState,
}

/// Sliding-window rate governor.
///
/// Config and counters sit behind one lock that is never held across an
/// await; all sleeping goes through the injected [`Clock`].
#[derive(Debug)]
pub struct RateGovernor {
    inner: Mutex<GovernorInner>,
    clock: Arc<dyn Clock>,
}

impl RateGovernor {
    /// Create a governor with `config` (normalized) and the given clock.
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            inner: Mutex::new(GovernorInner {
                config: config.normalized(),
                state: RateState::new(now),
            }),
            clock,
        }
    }

    /// Create a governor driven by the system clock.
    pub fn with_system_clock(config: RateLimitConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    /// Wait until a send to `recipient` is allowed, or fail on a hard limit.
    pub async fn admit(&self, recipient: &str) -> Result<SendPermit<'_>> {
        self.admit_with(recipient, &AdmitOptions::default()).await
    }

    /// Like [`admit`](Self::admit), bounded by `options`.
    ///
    /// The returned permit holds the send's window slot from the moment it is
    /// admitted, so concurrent callers cannot both take the last slot.
    pub async fn admit_with(
        &self,
        recipient: &str,
        options: &AdmitOptions,
    ) -> Result<SendPermit<'_>> {
        let mut waited = Duration::ZERO;

        loop {
            if let Some(cancel) = &options.cancel {
                cancel.check()?;
            }

            let wait = {
                let mut guard = self.lock();
                let GovernorInner { config, state } = &mut *guard;
                if !config.enabled {
                    return Ok(SendPermit::new(self, recipient, None, waited));
                }

                let now = self.clock.now();
                let was_paused = state.is_paused();
                let decision = state.evaluate(config, recipient, now);
                if !was_paused && state.is_paused() {
                    warn!("Rate limiting paused after evaluating send to {}", recipient);
                }

                match decision {
                    Admission::Proceed => {
                        let reservation = state.reserve(recipient, now);
                        if !waited.is_zero() {
                            debug!("Send to {} admitted after waiting {:?}", recipient, waited);
                        }
                        return Ok(SendPermit::new(self, recipient, Some(reservation), waited));
                    }
                    Admission::Reject(err) => {
                        warn!("Send to {} rejected: {}", recipient, err);
                        return Err(err);
                    }
                    Admission::Wait(wait) => wait,
                }
            };

            if let Some(max_wait) = options.max_wait {
                let remaining = max_wait.saturating_sub(waited);
                if wait > remaining {
                    return Err(CourierError::AdmissionTimeout {
                        needed: wait,
                        remaining,
                    });
                }
            }

            info!("Rate limit reached for {}, waiting {:?}", recipient, wait);
            match &options.cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = self.clock.sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(CourierError::Cancelled),
                    }
                }
                None => self.clock.sleep(wait).await,
            }
            waited += wait;
        }
    }

    /// Sleep the human-like gap before a send.
    ///
    /// Returns the delay applied.
    pub async fn apply_pacing_delay(&self, has_links: bool) -> Duration {
        let config = self.config();
        if !config.enabled || config.min_delay_ms <= 0 {
            return Duration::ZERO;
        }

        let mut delay = config.min_delay();
        if config.randomize_delays && config.max_delay_ms > config.min_delay_ms {
            let span = u64::try_from(config.max_delay_ms - config.min_delay_ms).unwrap_or(0);
            let jitter = rand::rng().random_range(0..span);
            delay += Duration::from_millis(jitter);
        }
        if has_links {
            delay += config.link_extra_delay();
        }

        debug!("Pacing delay {:?} (links: {})", delay, has_links);
        self.clock.sleep(delay).await;
        delay
    }

    /// Show a "composing" indicator to `target` and wait the typing delay.
    ///
    /// The indicator is left for the remote side to clear. When the presence
    /// signal fails nothing is slept. Returns the delay applied.
    pub async fn simulate_typing_if_enabled(
        &self,
        transport: &dyn MessagingTransport,
        target: &ChatTarget,
    ) -> Duration {
        let config = self.config();
        if !config.enabled || !config.simulate_typing || config.typing_delay_ms <= 0 {
            return Duration::ZERO;
        }

        if let Err(e) = transport
            .send_chat_presence(target, ChatPresence::Composing, PresenceMedia::Text)
            .await
        {
            debug!("Typing indicator for {} failed: {}", target, e);
            return Duration::ZERO;
        }

        let delay = config.typing_delay();
        self.clock.sleep(delay).await;
        delay
    }

    /// Record a completed send to `recipient` that was not admitted through
    /// a [`SendPermit`].
    pub fn record_sent(&self, recipient: &str) {
        let now = self.clock.now();
        self.lock().state.record_sent(recipient, now);
    }

    /// Record an inbound reply.
    pub fn record_response(&self) {
        let now = self.clock.now();
        self.lock().state.record_response(now);
    }

    /// Lift a pause. Counters are left as they are.
    pub fn unpause(&self) {
        if self.lock().state.unpause() {
            info!("Rate limiting unpaused");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.lock().state.is_paused()
    }

    /// Replace the policy. The new config is normalized first.
    pub fn set_config(&self, config: RateLimitConfig) -> RateLimitConfig {
        let config = config.normalized();
        self.lock().config = config.clone();
        info!(
            "Rate limit config updated: enabled={}, per_minute={}, per_hour={}, new_contacts_per_day={}",
            config.enabled,
            config.max_messages_per_minute,
            config.max_messages_per_hour,
            config.max_new_contacts_per_day
        );
        config
    }

    pub fn config(&self) -> RateLimitConfig {
        self.lock().config.clone()
    }

    pub fn stats(&self) -> RateLimitStats {
        let now = self.clock.now();
        let mut guard = self.lock();
        let GovernorInner { config, state } = &mut *guard;
        state.stats(config, now)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, GovernorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A window slot held for one admitted send.
///
/// Call [`confirm`](Self::confirm) once the transport accepted the message.
/// Dropping an unconfirmed permit gives the slot back, so failed sends never
/// count against the limits.
#[must_use = "dropping a permit releases its window slot"]
#[derive(Debug)]
pub struct SendPermit<'a> {
    governor: &'a RateGovernor,
    recipient: String,
    reservation: Option<u64>,
    waited: Duration,
}

impl<'a> SendPermit<'a> {
    fn new(
        governor: &'a RateGovernor,
        recipient: &str,
        reservation: Option<u64>,
        waited: Duration,
    ) -> Self {
        Self {
            governor,
            recipient: recipient.to_string(),
            reservation,
            waited,
        }
    }

    /// Time spent waiting on soft limits before admission.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    /// Count the send as done.
    pub fn confirm(mut self) {
        let now = self.governor.clock.now();
        let mut guard = self.governor.lock();
        match self.reservation.take() {
            Some(id) => guard.state.confirm(id, now),
            None => guard.state.record_sent(&self.recipient, now),
        }
    }
}

impl Drop for SendPermit<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.reservation.take() {
            debug!("Releasing unused send slot for {}", self.recipient);
            self.governor.lock().state.release(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::transport::LoopbackTransport;
    use chrono::{DateTime, Local, TimeZone};

    fn start() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
    }

    fn governor(config: RateLimitConfig) -> (RateGovernor, MockClock) {
        let clock = MockClock::new(start());
        (RateGovernor::new(config, Arc::new(clock.clone())), clock)
    }

    fn window_only(per_minute: i64) -> RateLimitConfig {
        RateLimitConfig {
            max_messages_per_minute: per_minute,
            max_messages_per_hour: 0,
            max_new_contacts_per_day: 0,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_admits_immediately() {
        let (governor, clock) = governor(RateLimitConfig::disabled());
        for _ in 0..50 {
            governor.admit("a").await.unwrap().confirm();
        }
        assert!(clock.sleeps().is_empty());
        assert_eq!(governor.apply_pacing_delay(true).await, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_third_send_waits_for_window() {
        let (governor, clock) = governor(window_only(2));

        for _ in 0..2 {
            governor.admit("a").await.unwrap().confirm();
        }
        assert!(clock.sleeps().is_empty());

        governor.admit("a").await.unwrap().confirm();
        assert_eq!(clock.total_slept(), Duration::from_millis(60_100));
    }

    #[tokio::test]
    async fn test_sliding_window_never_exceeds_cap() {
        let cap = 3;
        let (governor, clock) = governor(window_only(cap));
        let mut sent_at = Vec::new();

        for _ in 0..12 {
            governor.admit("a").await.unwrap().confirm();
            sent_at.push(clock.now());
            clock.advance(Duration::from_secs(5));
        }

        for (i, t) in sent_at.iter().enumerate() {
            let in_window = sent_at[..=i]
                .iter()
                .filter(|s| **s > *t - chrono::Duration::seconds(60))
                .count();
            assert!(in_window <= cap as usize, "window ending at send {i} has {in_window}");
        }
    }

    #[tokio::test]
    async fn test_hard_limit_returns_without_sleeping() {
        let (governor, clock) = governor(RateLimitConfig {
            max_new_contacts_per_day: 1,
            ..RateLimitConfig::default()
        });

        governor.admit("a").await.unwrap().confirm();

        let err = governor.admit("b").await.map(|_| ()).unwrap_err();
        assert!(matches!(err, CourierError::NewContactLimit { count: 1, max: 1 }));
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_unpause() {
        let (governor, _clock) = governor(RateLimitConfig {
            pause_on_low_response: true,
            response_rate_threshold: 0.5,
            max_messages_per_minute: 0,
            max_messages_per_hour: 0,
            max_new_contacts_per_day: 0,
            ..RateLimitConfig::default()
        });

        for _ in 0..10 {
            governor.record_sent("a");
        }
        for _ in 0..4 {
            governor.record_response();
        }

        let err = governor.admit("a").await.map(|_| ()).unwrap_err();
        match err {
            CourierError::RateLimitPaused { reason } => {
                assert_eq!(reason, "low response rate: 40.0% (threshold: 50.0%)")
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(governor.stats().is_paused);

        governor.unpause();
        let stats = governor.stats();
        assert!(!stats.is_paused);
        assert_eq!(stats.messages_sent_today, 10);
        assert_eq!(stats.responses_received, 4);

        // The same counters must not trip the valve again straight away.
        governor.admit("a").await.unwrap().confirm();
        assert!(!governor.is_paused());
    }

    #[tokio::test]
    async fn test_admit_succeeds_after_unpause() {
        let (governor, _clock) = governor(RateLimitConfig {
            pause_on_low_response: true,
            response_rate_threshold: 0.5,
            max_messages_per_minute: 0,
            max_messages_per_hour: 0,
            max_new_contacts_per_day: 0,
            ..RateLimitConfig::default()
        });

        for _ in 0..10 {
            governor.record_sent("a");
        }
        governor.record_response();
        governor.record_response();

        let err = governor.admit("a").await.map(|_| ()).unwrap_err();
        assert!(matches!(err, CourierError::RateLimitPaused { .. }));

        governor.unpause();
        for _ in 0..3 {
            governor.admit("a").await.unwrap().confirm();
        }
        assert_eq!(governor.stats().messages_sent_today, 13);
    }

    #[tokio::test]
    async fn test_held_permits_fill_the_window() {
        let (governor, clock) = governor(window_only(2));

        let first = governor.admit("a").await.unwrap();
        let second = governor.admit("a").await.unwrap();
        assert!(clock.sleeps().is_empty());
        assert_eq!(governor.stats().messages_sent_last_minute, 2);

        let third = governor.admit("a").await.unwrap();
        assert_eq!(third.waited(), Duration::from_millis(60_100));

        first.confirm();
        second.confirm();
        third.confirm();
        assert_eq!(governor.stats().messages_sent_today, 3);
    }

    #[tokio::test]
    async fn test_dropped_permit_frees_its_slot() {
        let (governor, clock) = governor(RateLimitConfig {
            max_new_contacts_per_day: 1,
            ..window_only(1)
        });

        let permit = governor.admit("a").await.unwrap();
        assert_eq!(permit.recipient(), "a");
        drop(permit);

        let stats = governor.stats();
        assert_eq!(stats.messages_sent_last_minute, 0);
        assert_eq!(stats.messages_sent_today, 0);
        assert_eq!(stats.new_contacts_today, 0);

        governor.admit("b").await.unwrap().confirm();
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_max_wait_fails_fast() {
        let (governor, clock) = governor(window_only(1));
        governor.admit("a").await.unwrap().confirm();

        let options = AdmitOptions::default().with_max_wait(Duration::from_secs(10));
        let err = governor.admit_with("a", &options).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, CourierError::AdmissionTimeout { .. }));
        assert!(clock.sleeps().is_empty());

        let options = AdmitOptions::default().with_max_wait(Duration::from_secs(61));
        let permit = governor.admit_with("a", &options).await.unwrap();
        assert_eq!(permit.waited(), Duration::from_millis(60_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let governor = Arc::new(RateGovernor::with_system_clock(window_only(1)));
        governor.admit("a").await.unwrap().confirm();

        let token = CancellationToken::new();
        let pending = {
            let governor = governor.clone();
            let options = AdmitOptions::default().with_cancel(token.clone());
            tokio::spawn(async move { governor.admit_with("a", &options).await.map(|p| p.waited()) })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(CourierError::Cancelled)));
    }

    #[tokio::test]
    async fn test_pacing_delay_bounds() {
        let (governor, clock) = governor(RateLimitConfig {
            min_delay_ms: 1000,
            max_delay_ms: 2000,
            link_extra_delay_ms: 500,
            ..RateLimitConfig::default()
        });

        for _ in 0..20 {
            let delay = governor.apply_pacing_delay(false).await;
            assert!(delay >= Duration::from_millis(1000) && delay < Duration::from_millis(2000));
        }

        let delay = governor.apply_pacing_delay(true).await;
        assert!(delay >= Duration::from_millis(1500) && delay < Duration::from_millis(2500));
        assert_eq!(clock.sleeps().len(), 21);
    }

    #[tokio::test]
    async fn test_pacing_without_randomization_is_exact() {
        let (governor, _clock) = governor(RateLimitConfig {
            min_delay_ms: 1200,
            max_delay_ms: 9000,
            randomize_delays: false,
            ..RateLimitConfig::default()
        });
        assert_eq!(
            governor.apply_pacing_delay(false).await,
            Duration::from_millis(1200)
        );
    }

    #[tokio::test]
    async fn test_typing_signals_then_sleeps() {
        let (governor, clock) = governor(RateLimitConfig::default());
        let transport = LoopbackTransport::new();
        let target = ChatTarget::Phone("15550001".into());

        let delay = governor.simulate_typing_if_enabled(&transport, &target).await;
        assert_eq!(delay, Duration::from_millis(2000));
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(2000)]);
        assert_eq!(
            transport.chat_presences(),
            vec![(target, ChatPresence::Composing, PresenceMedia::Text)]
        );
    }

    #[tokio::test]
    async fn test_typing_skips_sleep_when_presence_fails() {
        let (governor, clock) = governor(RateLimitConfig::default());
        let transport = LoopbackTransport::new();
        transport.fail_presence(true);

        let delay = governor
            .simulate_typing_if_enabled(&transport, &ChatTarget::Phone("1".into()))
            .await;
        assert_eq!(delay, Duration::ZERO);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_typing_disabled() {
        let (governor, clock) = governor(RateLimitConfig {
            simulate_typing: false,
            ..RateLimitConfig::default()
        });
        let transport = LoopbackTransport::new();
        governor
            .simulate_typing_if_enabled(&transport, &ChatTarget::Phone("1".into()))
            .await;
        assert!(transport.chat_presences().is_empty());
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_set_config_normalizes() {
        let (governor, _clock) = governor(RateLimitConfig::default());
        let applied = governor.set_config(RateLimitConfig {
            min_delay_ms: -10,
            max_delay_ms: -20,
            ..RateLimitConfig::default()
        });
        assert_eq!(applied.min_delay_ms, 0);
        assert_eq!(applied.max_delay_ms, 0);
        assert_eq!(governor.config(), applied);
    }
}
