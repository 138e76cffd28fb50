//! Per-provider circuit breakers.
//!
//! When a provider fails repeatedly its circuit opens and the orchestrator
//! skips it without a network call until the recovery timeout has passed.
//! Each provider has its own circuit so providers recover independently.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::events::{EngineEvent, EventBus};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Consecutive probe successes needed to close it again
    pub success_threshold: u32,

    /// Time the circuit stays open before probing
    #[serde(with = "crate::config::duration_str")]
    pub recovery_timeout: Duration,

    /// Probes admitted concurrently while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if self.success_threshold == 0 {
            return Err("success_threshold must be at least 1".to_string());
        }
        if self.half_open_max_calls == 0 {
            return Err("half_open_max_calls must be at least 1".to_string());
        }
        Ok(())
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Calls are rejected without reaching the provider
    Open,

    /// A bounded number of probe calls are let through
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

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one provider's circuit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub probes_in_flight: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Proof that a call was let through, stamped with the circuit episode it
/// was admitted in.
///
/// Every transition starts a new episode. An outcome whose admission belongs
/// to an earlier episode is ignored, so a slow call admitted while closed
/// cannot settle a half-open probe slot or close the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    epoch: u64,
    probe: bool,
}

impl Admission {
    /// Whether the call was admitted as a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

#[derive(Debug)]
struct ProviderCircuit {
    config: CircuitBreakerConfig,
    state: CircuitState,
    epoch: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    probes_in_flight: u32,
    opened_at: Option<Instant>,
    opened_wall: Option<DateTime<Utc>>,
}

impl ProviderCircuit {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            epoch: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            probes_in_flight: 0,
            opened_at: None,
            opened_wall: None,
        }
    }

    fn recovery_elapsed(&self) -> bool {
        self.opened_at
            .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout)
    }

    fn admission(&self) -> Admission {
        Admission {
            epoch: self.epoch,
            probe: self.state == CircuitState::HalfOpen,
        }
    }

    fn is_stale(&self, provider: &str, admission: Admission) -> bool {
        if admission.epoch == self.epoch {
            return false;
        }
        tracing::debug!(
            provider = %provider,
            admitted_in = admission.epoch,
            current = self.epoch,
            "Ignoring outcome of a call admitted before the last transition"
        );
        true
    }
}

/// Registry of circuits, one per provider.
///
/// Circuits are created eagerly via [`register`](Self::register), or lazily
/// on first use of [`allow`](Self::allow) and [`try_acquire`](Self::try_acquire),
/// and live until the registry is dropped. Every transition happens under
/// that provider's own lock.
pub struct CircuitBreakerRegistry {
    circuits: RwLock<HashMap<String, Arc<Mutex<ProviderCircuit>>>>,
    defaults: CircuitBreakerConfig,
    overrides: BTreeMap<String, CircuitBreakerConfig>,
    events: EventBus,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self::with_overrides(defaults, BTreeMap::new(), EventBus::default())
    }

    pub fn with_overrides(
        defaults: CircuitBreakerConfig,
        overrides: BTreeMap<String, CircuitBreakerConfig>,
        events: EventBus,
    ) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            defaults,
            overrides,
            events,
        }
    }

    /// Thresholds in effect for a provider.
    pub fn config_for(&self, provider: &str) -> &CircuitBreakerConfig {
        self.overrides.get(provider).unwrap_or(&self.defaults)
    }

    fn circuit(&self, provider: &str) -> Arc<Mutex<ProviderCircuit>> {
        if let Some(circuit) = self.existing(provider) {
            return circuit;
        }

        let config = self.config_for(provider).clone();
        self.circuits
            .write()
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ProviderCircuit::new(config))))
            .clone()
    }

    fn existing(&self, provider: &str) -> Option<Arc<Mutex<ProviderCircuit>>> {
        self.circuits.read().get(provider).cloned()
    }

    /// Create circuits for providers that do not have one yet.
    pub fn register<'a>(&self, providers: impl IntoIterator<Item = &'a str>) {
        for provider in providers {
            self.circuit(provider);
        }
    }

    pub fn is_registered(&self, provider: &str) -> bool {
        self.circuits.read().contains_key(provider)
    }

    /// Ask whether a call to `provider` may go out now.
    ///
    /// Lazily moves an open circuit to half-open once its recovery timeout
    /// has passed. In half-open, an admitted call counts as an in-flight
    /// probe until its outcome is recorded, so every admission must be
    /// handed back to exactly one [`record_success`](Self::record_success)
    /// or [`record_failure`](Self::record_failure).
    /// [`try_acquire`](Self::try_acquire) pairs them automatically.
    pub fn allow(&self, provider: &str) -> Option<Admission> {
        let circuit = self.circuit(provider);
        let mut circuit = circuit.lock();

        match circuit.state {
            CircuitState::Closed => Some(circuit.admission()),
            CircuitState::Open => {
                if !circuit.recovery_elapsed() {
                    return None;
                }
                circuit.consecutive_successes = 0;
                circuit.probes_in_flight = 1;
                self.transition(provider, &mut circuit, CircuitState::HalfOpen);
                Some(circuit.admission())
            }
            CircuitState::HalfOpen => {
                if circuit.probes_in_flight < circuit.config.half_open_max_calls {
                    circuit.probes_in_flight += 1;
                    Some(circuit.admission())
                } else {
                    tracing::debug!(
                        provider = %provider,
                        probes = circuit.probes_in_flight,
                        "Half-open probe limit reached"
                    );
                    None
                }
            }
        }
    }

    /// Record that an admitted call succeeded.
    pub fn record_success(&self, provider: &str, admission: Admission) {
        let circuit = self.circuit(provider);
        let mut circuit = circuit.lock();
        if circuit.is_stale(provider, admission) {
            return;
        }

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.probes_in_flight = circuit.probes_in_flight.saturating_sub(1);
                circuit.consecutive_successes += 1;
                if circuit.consecutive_successes >= circuit.config.success_threshold {
                    circuit.consecutive_failures = 0;
                    circuit.consecutive_successes = 0;
                    circuit.probes_in_flight = 0;
                    circuit.opened_at = None;
                    circuit.opened_wall = None;
                    self.transition(provider, &mut circuit, CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                circuit.consecutive_failures = 0;
            }
            // Open never admits within its own episode
            CircuitState::Open => {}
        }
    }

    /// Record that an admitted call failed.
    pub fn record_failure(&self, provider: &str, admission: Admission) {
        let circuit = self.circuit(provider);
        let mut circuit = circuit.lock();
        if circuit.is_stale(provider, admission) {
            return;
        }

        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= circuit.config.failure_threshold {
                    tracing::warn!(
                        provider = %provider,
                        failures = circuit.consecutive_failures,
                        "Circuit opened after repeated failures"
                    );
                    Self::open(&mut circuit);
                    self.transition(provider, &mut circuit, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(provider = %provider, "Circuit reopened after failed probe");
                Self::open(&mut circuit);
                self.transition(provider, &mut circuit, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn open(circuit: &mut ProviderCircuit) {
        circuit.consecutive_successes = 0;
        circuit.probes_in_flight = 0;
        circuit.opened_at = Some(Instant::now());
        circuit.opened_wall = Some(Utc::now());
    }

    fn transition(&self, provider: &str, circuit: &mut ProviderCircuit, to: CircuitState) {
        let from = circuit.state;
        if from == to {
            return;
        }
        circuit.state = to;
        circuit.epoch += 1;

        tracing::info!(provider = %provider, from = %from, to = %to, "Circuit transition");
        self.events.emit(EngineEvent::CircuitTransition {
            provider: provider.to_string(),
            from,
            to,
            at: Utc::now(),
        });
    }

    /// Admit a call and return a permit that records its outcome.
    ///
    /// Creates the provider's circuit if it has none yet.
    pub fn try_acquire(self: &Arc<Self>, provider: &str) -> Option<CircuitPermit> {
        self.allow(provider).map(|admission| CircuitPermit {
            registry: Arc::clone(self),
            provider: provider.to_string(),
            admission: Some(admission),
        })
    }

    /// Like [`try_acquire`](Self::try_acquire), but a provider without a
    /// registered circuit is let through ungated and leaves no state
    /// behind.
    pub fn try_acquire_registered(self: &Arc<Self>, provider: &str) -> Option<CircuitPermit> {
        if self.is_registered(provider) {
            return self.try_acquire(provider);
        }
        tracing::debug!(provider = %provider, "No registered circuit, call is not gated");
        Some(CircuitPermit {
            registry: Arc::clone(self),
            provider: provider.to_string(),
            admission: None,
        })
    }

    /// Current state of a provider's circuit, without side effects.
    pub fn state(&self, provider: &str) -> CircuitState {
        self.existing(provider)
            .map_or(CircuitState::Closed, |c| c.lock().state)
    }

    pub fn snapshot(&self, provider: &str) -> CircuitSnapshot {
        match self.existing(provider) {
            Some(circuit) => Self::describe(provider, &circuit.lock()),
            None => Self::describe(
                provider,
                &ProviderCircuit::new(self.config_for(provider).clone()),
            ),
        }
    }

    /// Snapshots of every known circuit, sorted by provider.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let circuits: Vec<_> = self
            .circuits
            .read()
            .iter()
            .map(|(name, circuit)| (name.clone(), circuit.clone()))
            .collect();

        let mut snapshots: Vec<_> = circuits
            .iter()
            .map(|(name, circuit)| Self::describe(name, &circuit.lock()))
            .collect();
        snapshots.sort_by(|a, b| a.provider.cmp(&b.provider));
        snapshots
    }

    fn describe(provider: &str, circuit: &ProviderCircuit) -> CircuitSnapshot {
        CircuitSnapshot {
            provider: provider.to_string(),
            state: circuit.state,
            consecutive_failures: circuit.consecutive_failures,
            consecutive_successes: circuit.consecutive_successes,
            probes_in_flight: circuit.probes_in_flight,
            opened_at: circuit.opened_wall,
        }
    }

    /// Close one provider's circuit and clear its counters.
    ///
    /// Calls admitted before the reset no longer count.
    pub fn reset(&self, provider: &str) {
        let circuit = self.circuit(provider);
        let mut circuit = circuit.lock();
        let config = circuit.config.clone();
        let from = circuit.state;
        let epoch = circuit.epoch + 1;
        *circuit = ProviderCircuit::new(config);
        circuit.epoch = epoch;
        if from != CircuitState::Closed {
            circuit.state = from;
            self.transition(provider, &mut circuit, CircuitState::Closed);
        }
    }

    /// Close every circuit.
    pub fn reset_all(&self) {
        let providers: Vec<String> = self.circuits.read().keys().cloned().collect();
        for provider in providers {
            self.reset(&provider);
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("defaults", &self.defaults)
            .field("circuits", &self.circuits.read().len())
            .finish()
    }
}

/// Admission for one call. Settle it with [`succeed`](Self::succeed) or
/// [`fail`](Self::fail); dropping it unsettled (for example when the request
/// is cancelled mid-call) records a failure.
#[must_use = "an unsettled permit records a failure when dropped"]
pub struct CircuitPermit {
    registry: Arc<CircuitBreakerRegistry>,
    provider: String,
    /// `None` once settled, or for an ungated call
    admission: Option<Admission>,
}

impl CircuitPermit {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn is_gated(&self) -> bool {
        self.admission.is_some()
    }

    pub fn succeed(mut self) {
        if let Some(admission) = self.admission.take() {
            self.registry.record_success(&self.provider, admission);
        }
    }

    pub fn fail(mut self) {
        if let Some(admission) = self.admission.take() {
            self.registry.record_failure(&self.provider, admission);
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            tracing::warn!(provider = %self.provider, "Call abandoned in flight, counting as failure");
            self.registry.record_failure(&self.provider, admission);
        }
    }
}

impl fmt::Debug for CircuitPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("provider", &self.provider)
            .field("admission", &self.admission)
            .finish()
    }
}
