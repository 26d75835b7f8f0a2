//! Per-vendor circuit breaker over 5xx and transport failures.
//!
//! 429s and other 4xx responses never move the breaker: rate limiting is a
//! cooperation signal, not an infrastructure outage.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::store::StateStore;
use crate::types::Vendor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Breaker state for one vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorCircuit {
    pub state: CircuitState,
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub probe_in_flight: bool,
}

impl Default for VendorCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Three-state breaker per vendor. All operations are whole and atomic from
/// the caller's point of view.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    circuits: Mutex<HashMap<Vendor, VendorCircuit>>,
    store: Option<Arc<StateStore>>,
}

impl CircuitBreaker {
    pub fn new(
        failure_threshold: u32,
        cooldown_ms: i64,
        clock: Arc<dyn Clock>,
        store: Option<Arc<StateStore>>,
    ) -> Self {
        Self {
            failure_threshold,
            cooldown: Duration::milliseconds(cooldown_ms),
            clock,
            circuits: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Replace in-memory circuits with the shared store's view. Load failures
    /// leave everything closed.
    pub async fn load_from_store(&self) {
        let Some(store) = &self.store else { return };
        let loaded = store.load_breakers().await;
        if !loaded.is_empty() {
            tracing::info!(entries = loaded.len(), "loaded breaker state from store");
            *self.circuits.lock().unwrap() = loaded;
        }
    }

    /// Whether traffic may flow to this vendor right now. An open circuit
    /// whose cooldown has elapsed transitions to half-open and admits exactly
    /// one probe call; further callers are refused until the probe resolves.
    pub fn is_available(&self, vendor: Vendor) -> bool {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().unwrap();
        let circuit = circuits.entry(vendor).or_default();

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .is_none_or(|at| now - at >= self.cooldown);
                if !elapsed {
                    return false;
                }
                circuit.state = CircuitState::HalfOpen;
                circuit.probe_in_flight = true;
                tracing::info!(vendor = %vendor, "circuit half-open, admitting probe");
                self.write_through(vendor, circuit);
                true
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    false
                } else {
                    circuit.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Any success closes the circuit and clears the failure count.
    pub fn record_success(&self, vendor: Vendor) {
        let mut circuits = self.circuits.lock().unwrap();
        let circuit = circuits.entry(vendor).or_default();

        let was = circuit.state;
        circuit.state = CircuitState::Closed;
        circuit.failure_count = 0;
        circuit.opened_at = None;
        circuit.probe_in_flight = false;

        if was != CircuitState::Closed {
            tracing::info!(vendor = %vendor, "circuit closed");
        }
        self.write_through(vendor, circuit);
    }

    /// A 5xx or transport failure. Callers must not report 4xx here.
    pub fn record_failure(&self, vendor: Vendor) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().unwrap();
        let circuit = circuits.entry(vendor).or_default();

        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count += 1;
                if circuit.failure_count >= self.failure_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(now);
                    tracing::warn!(
                        vendor = %vendor,
                        failures = circuit.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                circuit.probe_in_flight = false;
                tracing::warn!(vendor = %vendor, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {
                circuit.opened_at = Some(now);
            }
        }
        self.write_through(vendor, circuit);
    }

    /// Current circuit for one vendor (closed default if never touched).
    pub fn state_of(&self, vendor: Vendor) -> VendorCircuit {
        self.circuits
            .lock()
            .unwrap()
            .get(&vendor)
            .cloned()
            .unwrap_or_default()
    }

    fn write_through(&self, vendor: Vendor, circuit: &VendorCircuit) {
        if let Some(store) = &self.store {
            let ttl_secs = (self.cooldown.num_seconds().max(1) as u64) * 3;
            store.spawn_save_breaker(vendor, circuit, ttl_secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_clock::ManualClock;

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new(3, 60_000, clock, None)
    }

    #[test]
    fn opens_only_at_threshold() {
        let clock = ManualClock::at(start());
        let b = breaker(clock.clone());

        b.record_failure(Vendor::OpenAi);
        b.record_failure(Vendor::OpenAi);
        assert!(b.is_available(Vendor::OpenAi));

        b.record_failure(Vendor::OpenAi);
        assert!(!b.is_available(Vendor::OpenAi));
        assert_eq!(b.state_of(Vendor::OpenAi).state, CircuitState::Open);
    }

    #[test]
    fn success_resets_the_count() {
        let clock = ManualClock::at(start());
        let b = breaker(clock.clone());

        b.record_failure(Vendor::OpenAi);
        b.record_failure(Vendor::OpenAi);
        b.record_success(Vendor::OpenAi);
        b.record_failure(Vendor::OpenAi);
        b.record_failure(Vendor::OpenAi);
        assert!(b.is_available(Vendor::OpenAi));
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let clock = ManualClock::at(start());
        let b = breaker(clock.clone());

        for _ in 0..3 {
            b.record_failure(Vendor::Anthropic);
        }
        assert!(!b.is_available(Vendor::Anthropic));

        clock.advance_ms(60_000);
        // First caller after cooldown is the probe.
        assert!(b.is_available(Vendor::Anthropic));
        assert_eq!(b.state_of(Vendor::Anthropic).state, CircuitState::HalfOpen);
        // Second caller is refused while the probe is in flight.
        assert!(!b.is_available(Vendor::Anthropic));
    }

    #[test]
    fn probe_success_closes_probe_failure_reopens() {
        let clock = ManualClock::at(start());
        let b = breaker(clock.clone());

        for _ in 0..3 {
            b.record_failure(Vendor::Google);
        }
        clock.advance_ms(60_000);
        assert!(b.is_available(Vendor::Google));
        b.record_success(Vendor::Google);
        assert_eq!(b.state_of(Vendor::Google).state, CircuitState::Closed);

        for _ in 0..3 {
            b.record_failure(Vendor::Google);
        }
        clock.advance_ms(60_000);
        assert!(b.is_available(Vendor::Google));
        b.record_failure(Vendor::Google);
        assert_eq!(b.state_of(Vendor::Google).state, CircuitState::Open);
        assert!(!b.is_available(Vendor::Google));
    }
}
