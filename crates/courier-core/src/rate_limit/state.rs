//! Sliding-window bookkeeping owned by the governor.
//!
//! Everything here is synchronous and takes `now` as an argument; the
//! governor holds it under its lock and performs all waiting outside.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use super::config::RateLimitConfig;
use crate::clock::{to_chrono, to_std};
use crate::config::RateLimitDefaults;
use crate::error::CourierError;

/// Outcome of a single admission evaluation.
#[derive(Debug)]
pub(crate) enum Admission {
    Proceed,
    /// A soft limit is hit; retry after this long.
    Wait(Duration),
    /// A hard limit is hit; waiting will not help.
    Reject(CourierError),
}

/// Snapshot of governor counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStats {
    pub messages_sent_last_minute: u32,
    pub messages_sent_last_hour: u32,
    pub messages_sent_today: u32,
    pub new_contacts_today: u32,
    pub responses_received: u32,
    pub response_rate: f64,
    pub is_paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    pub last_message_time: Option<DateTime<Local>>,
    pub next_allowed_time: Option<DateTime<Local>>,
}

/// A window slot booked by an admission whose send has not finished yet.
#[derive(Debug)]
struct Reservation {
    id: u64,
    at: DateTime<Local>,
    recipient: String,
    /// This reservation added the recipient to the seen-set.
    new_contact: bool,
}

#[derive(Debug)]
pub(crate) struct RateState {
    /// Send and reservation times within the trailing hour, oldest first.
    sent: VecDeque<DateTime<Local>>,
    reserved: Vec<Reservation>,
    next_reservation: u64,
    seen_contacts: HashSet<String>,
    new_contacts_today: HashMap<String, DateTime<Local>>,
    messages_sent_today: u32,
    responses_received: u32,
    last_message_time: Option<DateTime<Local>>,
    /// Counters at the last unpause; the response valve only looks past them.
    valve_sent_base: u32,
    valve_responses_base: u32,
    paused: bool,
    pause_reason: Option<String>,
    daily_reset: DateTime<Local>,
}

impl RateState {
    pub(crate) fn new(now: DateTime<Local>) -> Self {
        Self {
            sent: VecDeque::new(),
            reserved: Vec::new(),
            next_reservation: 1,
            seen_contacts: HashSet::new(),
            new_contacts_today: HashMap::new(),
            messages_sent_today: 0,
            responses_received: 0,
            last_message_time: None,
            valve_sent_base: 0,
            valve_responses_base: 0,
            paused: false,
            pause_reason: None,
            daily_reset: now,
        }
    }

    /// Reset the per-day counters when `now` falls on a later calendar day.
    ///
    /// Returns true when a reset happened.
    pub(crate) fn reset_daily_if_needed(&mut self, now: DateTime<Local>) -> bool {
        if now.date_naive() == self.daily_reset.date_naive() {
            return false;
        }
        self.messages_sent_today = 0;
        self.responses_received = 0;
        self.valve_sent_base = 0;
        self.valve_responses_base = 0;
        self.new_contacts_today.clear();
        self.daily_reset = now;
        true
    }

    fn prune(&mut self, now: DateTime<Local>) {
        let cutoff = now - to_chrono(RateLimitDefaults::HOUR_WINDOW);
        while self.sent.front().is_some_and(|t| *t <= cutoff) {
            self.sent.pop_front();
        }
    }

    fn count_within(&self, now: DateTime<Local>, window: Duration) -> usize {
        let cutoff = now - to_chrono(window);
        self.sent.iter().filter(|t| **t > cutoff).count()
    }

    /// Wait needed before another send fits in `window`, if the window is full.
    fn window_wait(&self, now: DateTime<Local>, window: Duration, limit: i64) -> Option<Duration> {
        let limit = usize::try_from(limit).ok().filter(|l| *l > 0)?;
        let cutoff = now - to_chrono(window);
        let mut in_window = self.sent.iter().filter(|t| **t > cutoff);
        let oldest = *in_window.next()?;
        if in_window.count() + 1 < limit {
            return None;
        }
        let frees_at = oldest + to_chrono(window) + to_chrono(RateLimitDefaults::WINDOW_SLACK);
        Some(to_std(frees_at - now))
    }

    /// Decide whether a send to `recipient` may go out at `now`.
    ///
    /// Hard conditions are checked before soft ones so a send that would be
    /// refused anyway never waits first.
    pub(crate) fn evaluate(
        &mut self,
        config: &RateLimitConfig,
        recipient: &str,
        now: DateTime<Local>,
    ) -> Admission {
        self.reset_daily_if_needed(now);

        if self.paused {
            return Admission::Reject(CourierError::RateLimitPaused {
                reason: self.pause_reason.clone().unwrap_or_default(),
            });
        }

        self.prune(now);

        if config.max_new_contacts_per_day > 0 && !self.seen_contacts.contains(recipient) {
            let count = self.new_contacts_today.len();
            if i64::try_from(count).unwrap_or(i64::MAX) >= config.max_new_contacts_per_day {
                return Admission::Reject(CourierError::NewContactLimit {
                    count: u32::try_from(count).unwrap_or(u32::MAX),
                    max: u32::try_from(config.max_new_contacts_per_day).unwrap_or(u32::MAX),
                });
            }
        }

        let valve_sent = self.messages_sent_today.saturating_sub(self.valve_sent_base);
        if config.pause_on_low_response
            && valve_sent >= RateLimitDefaults::MIN_SENDS_FOR_RESPONSE_RATE
        {
            let valve_responses = self
                .responses_received
                .saturating_sub(self.valve_responses_base);
            let rate = f64::from(valve_responses) / f64::from(valve_sent);
            if rate < config.response_rate_threshold {
                let reason = format!(
                    "low response rate: {:.1}% (threshold: {:.1}%)",
                    rate * 100.0,
                    config.response_rate_threshold * 100.0
                );
                self.pause(reason.clone());
                return Admission::Reject(CourierError::RateLimitPaused { reason });
            }
        }

        if let Some(wait) = self.window_wait(
            now,
            RateLimitDefaults::MINUTE_WINDOW,
            config.max_messages_per_minute,
        ) {
            return Admission::Wait(wait);
        }

        if let Some(wait) = self.window_wait(
            now,
            RateLimitDefaults::HOUR_WINDOW,
            config.max_messages_per_hour,
        ) {
            return Admission::Wait(wait);
        }

        Admission::Proceed
    }

    pub(crate) fn record_sent(&mut self, recipient: &str, now: DateTime<Local>) {
        self.reset_daily_if_needed(now);
        self.sent.push_back(now);
        self.messages_sent_today += 1;
        self.last_message_time = Some(now);

        if self.seen_contacts.insert(recipient.to_string()) {
            self.new_contacts_today.insert(recipient.to_string(), now);
        }
    }

    /// Book a window slot for an admitted send to `recipient`.
    ///
    /// The slot counts against the minute and hour windows, and an unseen
    /// recipient counts against the new-contact cap, until the reservation is
    /// confirmed or released.
    pub(crate) fn reserve(&mut self, recipient: &str, now: DateTime<Local>) -> u64 {
        let id = self.next_reservation;
        self.next_reservation += 1;

        let new_contact = self.seen_contacts.insert(recipient.to_string());
        if new_contact {
            self.new_contacts_today.insert(recipient.to_string(), now);
        }
        self.sent.push_back(now);
        self.reserved.push(Reservation {
            id,
            at: now,
            recipient: recipient.to_string(),
            new_contact,
        });
        id
    }

    /// Turn a reservation into a recorded send. Its window slot is kept.
    pub(crate) fn confirm(&mut self, id: u64, now: DateTime<Local>) {
        let Some(pos) = self.reserved.iter().position(|r| r.id == id) else {
            return;
        };
        let reservation = self.reserved.swap_remove(pos);
        self.reset_daily_if_needed(now);
        self.messages_sent_today += 1;
        self.last_message_time = Some(now);

        // The contact is now known for good; no pending reservation may undo it.
        for other in self
            .reserved
            .iter_mut()
            .filter(|r| r.recipient == reservation.recipient)
        {
            other.new_contact = false;
        }
        if self.seen_contacts.insert(reservation.recipient.clone()) {
            self.new_contacts_today.insert(reservation.recipient, now);
        }
    }

    /// Drop a reservation whose send did not happen.
    pub(crate) fn release(&mut self, id: u64) {
        let Some(pos) = self.reserved.iter().position(|r| r.id == id) else {
            return;
        };
        let reservation = self.reserved.swap_remove(pos);

        if let Some(slot) = self.sent.iter().position(|t| *t == reservation.at) {
            self.sent.remove(slot);
        }

        if reservation.new_contact {
            match self
                .reserved
                .iter_mut()
                .find(|r| r.recipient == reservation.recipient)
            {
                Some(other) => other.new_contact = true,
                None => {
                    self.seen_contacts.remove(&reservation.recipient);
                    self.new_contacts_today.remove(&reservation.recipient);
                }
            }
        }
    }

    pub(crate) fn record_response(&mut self, now: DateTime<Local>) {
        self.reset_daily_if_needed(now);
        self.responses_received += 1;
    }

    pub(crate) fn pause(&mut self, reason: String) {
        self.paused = true;
        self.pause_reason = Some(reason);
    }

    /// Clear the pause. The response valve restarts from the current
    /// counters, so it needs a fresh run of sends before it can trip again.
    pub(crate) fn unpause(&mut self) -> bool {
        let was_paused = self.paused;
        self.paused = false;
        self.pause_reason = None;
        self.valve_sent_base = self.messages_sent_today;
        self.valve_responses_base = self.responses_received;
        was_paused
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused
    }

    fn response_rate(&self) -> f64 {
        if self.messages_sent_today == 0 {
            0.0
        } else {
            f64::from(self.responses_received) / f64::from(self.messages_sent_today)
        }
    }

    pub(crate) fn stats(&mut self, config: &RateLimitConfig, now: DateTime<Local>) -> RateLimitStats {
        self.reset_daily_if_needed(now);
        self.prune(now);

        let count = |window| u32::try_from(self.count_within(now, window)).unwrap_or(u32::MAX);

        RateLimitStats {
            messages_sent_last_minute: count(RateLimitDefaults::MINUTE_WINDOW),
            messages_sent_last_hour: count(RateLimitDefaults::HOUR_WINDOW),
            messages_sent_today: self.messages_sent_today,
            new_contacts_today: u32::try_from(self.new_contacts_today.len()).unwrap_or(u32::MAX),
            responses_received: self.responses_received,
            response_rate: self.response_rate(),
            is_paused: self.paused,
            pause_reason: self.pause_reason.clone(),
            last_message_time: self.last_message_time,
            next_allowed_time: self
                .last_message_time
                .map(|last| last + to_chrono(config.min_delay())),
        }
    }
}
