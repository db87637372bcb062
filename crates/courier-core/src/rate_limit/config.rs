//! Rate-limit policy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::RateLimitDefaults;
use crate::error::{CourierError, Result};

/// Policy applied by the rate governor.
///
/// Delays are milliseconds. A limit of zero disables that particular cap.
/// Values are stored signed so that negative input can be accepted and then
/// clamped by [`normalized`](Self::normalized) rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub min_delay_ms: i64,
    pub max_delay_ms: i64,
    pub typing_delay_ms: i64,
    pub link_extra_delay_ms: i64,
    pub max_messages_per_minute: i64,
    pub max_messages_per_hour: i64,
    pub max_new_contacts_per_day: i64,
    pub simulate_typing: bool,
    pub randomize_delays: bool,
    pub pause_on_low_response: bool,
    /// Fraction in `[0, 1]` of sends that must receive a reply.
    pub response_rate_threshold: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay_ms: RateLimitDefaults::MIN_DELAY_MS,
            max_delay_ms: RateLimitDefaults::MAX_DELAY_MS,
            typing_delay_ms: RateLimitDefaults::TYPING_DELAY_MS,
            link_extra_delay_ms: RateLimitDefaults::LINK_EXTRA_DELAY_MS,
            max_messages_per_minute: RateLimitDefaults::MAX_MESSAGES_PER_MINUTE,
            max_messages_per_hour: RateLimitDefaults::MAX_MESSAGES_PER_HOUR,
            max_new_contacts_per_day: RateLimitDefaults::MAX_NEW_CONTACTS_PER_DAY,
            simulate_typing: true,
            randomize_delays: true,
            pause_on_low_response: false,
            response_rate_threshold: RateLimitDefaults::RESPONSE_RATE_THRESHOLD,
        }
    }
}

impl RateLimitConfig {
    /// A policy that admits everything without delay.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Clamp every field into its valid range.
    ///
    /// Negative delays and limits become zero, `max_delay_ms` is raised to at
    /// least `min_delay_ms`, and the response threshold is clamped to `[0, 1]`.
    pub fn normalized(mut self) -> Self {
        self.min_delay_ms = self.min_delay_ms.max(0);
        self.max_delay_ms = self.max_delay_ms.max(self.min_delay_ms);
        self.typing_delay_ms = self.typing_delay_ms.max(0);
        self.link_extra_delay_ms = self.link_extra_delay_ms.max(0);
        self.max_messages_per_minute = self.max_messages_per_minute.max(0);
        self.max_messages_per_hour = self.max_messages_per_hour.max(0);
        self.max_new_contacts_per_day = self.max_new_contacts_per_day.max(0);
        self.response_rate_threshold = if self.response_rate_threshold.is_nan() {
            0.0
        } else {
            self.response_rate_threshold.clamp(0.0, 1.0)
        };
        self
    }

    /// Overlay the fields present in `patch` onto this config.
    ///
    /// Unknown keys are ignored; keys with the wrong type are an
    /// invalid-params error. The result is not normalized.
    pub fn merged(&self, patch: &Value) -> Result<Self> {
        let Some(patch) = patch.as_object() else {
            return Err(CourierError::invalid_params(
                "rate limit config must be a JSON object",
            ));
        };

        let mut base = serde_json::to_value(self)?;
        if let Some(base) = base.as_object_mut() {
            for (key, value) in patch {
                if base.contains_key(key) {
                    base.insert(key.clone(), value.clone());
                }
            }
        }

        serde_json::from_value(base)
            .map_err(|e| CourierError::invalid_params(format!("invalid rate limit config: {e}")))
    }

    pub fn min_delay(&self) -> Duration {
        millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        millis(self.max_delay_ms)
    }

    pub fn typing_delay(&self) -> Duration {
        millis(self.typing_delay_ms)
    }

    pub fn link_extra_delay(&self) -> Duration {
        millis(self.link_extra_delay_ms)
    }
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}
