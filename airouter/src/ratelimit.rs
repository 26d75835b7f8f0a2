//! Per (vendor, model) rate-limit state: reactive cooldowns from 429s and
//! proactive skip from remaining-request counters.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::headers::{self, RateLimitSnapshot};
use crate::store::StateStore;
use crate::types::{ChainEntry, Vendor};

/// Tracked state for one (vendor, model) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRateState {
    pub cooling_down: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_requests_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_tokens_at: Option<DateTime<Utc>>,
}

impl ModelRateState {
    fn apply_snapshot(&mut self, snap: RateLimitSnapshot) {
        self.remaining_requests = snap.remaining_requests;
        self.remaining_tokens = snap.remaining_tokens;
        self.reset_requests_at = snap.reset_requests_at;
        self.reset_tokens_at = snap.reset_tokens_at;
    }
}

/// Tracks cooldowns and remaining counters per (vendor, model). Every public
/// operation is atomic behind a single lock; callers never observe partial
/// updates.
pub struct RateLimitTracker {
    low_threshold: u64,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<(Vendor, String), ModelRateState>>,
    store: Option<Arc<StateStore>>,
}

impl RateLimitTracker {
    pub fn new(low_threshold: u64, clock: Arc<dyn Clock>, store: Option<Arc<StateStore>>) -> Self {
        Self {
            low_threshold,
            clock,
            states: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Replace in-memory state with whatever the shared store holds. Any load
    /// failure leaves the map empty.
    pub async fn load_from_store(&self) {
        let Some(store) = &self.store else { return };
        let loaded = store.load_rates().await;
        if !loaded.is_empty() {
            tracing::info!(entries = loaded.len(), "loaded rate-limit state from store");
            *self.states.lock().unwrap() = loaded;
        }
    }

    /// Fold a vendor response into the tracked state. A 429 starts a
    /// cooldown; a 2xx overwrites the proactive counters and clears any
    /// elapsed cooldown. Other statuses leave the state untouched.
    pub fn update(&self, vendor: Vendor, model: &str, resp_headers: &HashMap<String, String>, status: u16) {
        let now = self.clock.now();
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry((vendor, model.to_string()))
            .or_default();

        if status == 429 {
            let retry_after = headers::parse_retry_after(
                resp_headers.get("retry-after").map(String::as_str),
                now,
            );
            state.cooling_down = true;
            state.cooldown_until = Some(now + retry_after);
            tracing::warn!(
                vendor = %vendor,
                model,
                cooldown_ms = retry_after.num_milliseconds(),
                "rate limited, cooling down"
            );
        } else if (200..300).contains(&status) {
            state.apply_snapshot(headers::extract(vendor, resp_headers, now));
            if state.cooling_down
                && state.cooldown_until.is_none_or(|until| now >= until)
            {
                state.cooling_down = false;
                state.cooldown_until = None;
            }
        } else {
            return;
        }

        self.write_through(vendor, model, state, now);
    }

    /// True when this (vendor, model) should be skipped: actively cooling, or
    /// the last response said remaining requests are strictly below the
    /// configured threshold. Elapsed cooldowns are cleared on the way out.
    pub fn should_avoid(&self, vendor: Vendor, model: &str) -> bool {
        let now = self.clock.now();
        let mut states = self.states.lock().unwrap();
        let Some(state) = states.get_mut(&(vendor, model.to_string())) else {
            return false;
        };

        if state.cooling_down {
            match state.cooldown_until {
                Some(until) if now < until => return true,
                _ => {
                    state.cooling_down = false;
                    state.cooldown_until = None;
                    self.write_through(vendor, model, state, now);
                }
            }
        }

        // Strict less-than: remaining == threshold is still available.
        state
            .remaining_requests
            .is_some_and(|remaining| remaining < self.low_threshold)
    }

    /// Earliest instant at which any candidate may be available. Candidates
    /// with no recorded pressure count as available now; if every candidate
    /// is blocked and none carries a reset, fall back to one minute out.
    pub fn earliest_available(&self, candidates: &[ChainEntry]) -> DateTime<Utc> {
        let now = self.clock.now();
        let states = self.states.lock().unwrap();

        let mut earliest: Option<DateTime<Utc>> = None;
        for entry in candidates {
            let available_at = match states.get(&(entry.vendor, entry.model.clone())) {
                None => Some(now),
                Some(state) => {
                    if state.cooling_down && state.cooldown_until.is_some_and(|until| now < until) {
                        state.cooldown_until
                    } else if state
                        .remaining_requests
                        .is_some_and(|remaining| remaining < self.low_threshold)
                    {
                        state.reset_requests_at
                    } else {
                        Some(now)
                    }
                }
            };
            if let Some(at) = available_at {
                earliest = Some(earliest.map_or(at, |e| e.min(at)));
            }
        }

        earliest
            .unwrap_or_else(|| now + Duration::seconds(60))
            .max(now)
    }

    /// Copy of the tracked map for the status endpoint.
    pub fn snapshot(&self) -> Vec<(Vendor, String, ModelRateState)> {
        let states = self.states.lock().unwrap();
        let mut entries: Vec<_> = states
            .iter()
            .map(|((vendor, model), state)| (*vendor, model.clone(), state.clone()))
            .collect();
        entries.sort_by(|a, b| (a.0.as_str(), &a.1).cmp(&(b.0.as_str(), &b.1)));
        entries
    }

    fn write_through(&self, vendor: Vendor, model: &str, state: &ModelRateState, now: DateTime<Utc>) {
        let Some(store) = &self.store else { return };
        let remaining_secs = state
            .cooldown_until
            .map(|until| (until - now).num_seconds().max(0) as u64)
            .unwrap_or(0);
        store.spawn_save_rate(vendor, model, state, remaining_secs.max(60));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_clock::ManualClock;

    fn tracker(clock: Arc<ManualClock>) -> RateLimitTracker {
        RateLimitTracker::new(5, clock, None)
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn retry_after(secs: u64) -> HashMap<String, String> {
        let mut h = HashMap::new();
        h.insert("retry-after".to_string(), secs.to_string());
        h
    }

    #[test]
    fn cooldown_blocks_until_elapsed() {
        let clock = ManualClock::at(start());
        let t = tracker(clock.clone());

        t.update(Vendor::OpenAi, "gpt-4o", &retry_after(30), 429);
        assert!(t.should_avoid(Vendor::OpenAi, "gpt-4o"));

        clock.advance_ms(29_999);
        assert!(t.should_avoid(Vendor::OpenAi, "gpt-4o"));

        clock.advance_ms(1);
        assert!(!t.should_avoid(Vendor::OpenAi, "gpt-4o"));
    }

    #[test]
    fn missing_retry_after_defaults_to_sixty_seconds() {
        let clock = ManualClock::at(start());
        let t = tracker(clock.clone());

        t.update(Vendor::OpenAi, "gpt-4o", &HashMap::new(), 429);
        clock.advance_ms(59_999);
        assert!(t.should_avoid(Vendor::OpenAi, "gpt-4o"));
        clock.advance_ms(1);
        assert!(!t.should_avoid(Vendor::OpenAi, "gpt-4o"));
    }

    #[test]
    fn low_remaining_is_strictly_below_threshold() {
        let clock = ManualClock::at(start());
        let t = tracker(clock.clone());

        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-remaining-requests".to_string(), "5".to_string());
        t.update(Vendor::OpenAi, "gpt-4o", &headers, 200);
        assert!(!t.should_avoid(Vendor::OpenAi, "gpt-4o"));

        headers.insert("x-ratelimit-remaining-requests".to_string(), "4".to_string());
        t.update(Vendor::OpenAi, "gpt-4o", &headers, 200);
        assert!(t.should_avoid(Vendor::OpenAi, "gpt-4o"));
    }

    #[test]
    fn success_clears_elapsed_cooldown() {
        let clock = ManualClock::at(start());
        let t = tracker(clock.clone());

        t.update(Vendor::Anthropic, "claude-opus-4-6", &retry_after(10), 429);
        clock.advance_ms(10_000);
        t.update(Vendor::Anthropic, "claude-opus-4-6", &HashMap::new(), 200);
        assert!(!t.should_avoid(Vendor::Anthropic, "claude-opus-4-6"));
    }

    #[test]
    fn earliest_available_picks_the_minimum() {
        let clock = ManualClock::at(start());
        let t = tracker(clock.clone());

        t.update(Vendor::OpenAi, "gpt-4o", &retry_after(30), 429);
        t.update(Vendor::Anthropic, "claude-opus-4-6", &retry_after(10), 429);

        let chain = vec![
            ChainEntry { vendor: Vendor::OpenAi, model: "gpt-4o".to_string() },
            ChainEntry { vendor: Vendor::Anthropic, model: "claude-opus-4-6".to_string() },
        ];
        assert_eq!(t.earliest_available(&chain), start() + Duration::seconds(10));
    }

    #[test]
    fn earliest_available_is_now_for_unknown_candidates() {
        let clock = ManualClock::at(start());
        let t = tracker(clock.clone());
        let chain = vec![ChainEntry {
            vendor: Vendor::Google,
            model: "gemini-2.5-pro".to_string(),
        }];
        assert_eq!(t.earliest_available(&chain), start());
    }

    #[test]
    fn earliest_available_falls_back_when_no_reset_is_known() {
        let clock = ManualClock::at(start());
        let t = tracker(clock.clone());

        // Low remaining but the vendor never sent a reset header.
        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-remaining-requests".to_string(), "0".to_string());
        t.update(Vendor::OpenAi, "gpt-4o", &headers, 200);

        let chain = vec![ChainEntry {
            vendor: Vendor::OpenAi,
            model: "gpt-4o".to_string(),
        }];
        assert_eq!(t.earliest_available(&chain), start() + Duration::seconds(60));
    }
}
