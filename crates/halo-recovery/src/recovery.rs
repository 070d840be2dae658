use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use halo_core::{ErrorCategory, RealtimeError};

/// Thresholds and cooldowns for the recovery coordinator.
#[derive(Clone, Debug)]
pub struct RecoveryConfig {
    /// Consecutive failures of one category tolerated before the circuit
    /// breaker takes over.
    pub failure_threshold: u32,
    pub breaker_cooldown: Duration,
    pub rate_limit_cooldown: Duration,
    pub message_failure_backoff: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            breaker_cooldown: Duration::from_secs(60),
            rate_limit_cooldown: Duration::from_secs(30),
            message_failure_backoff: Duration::from_secs(2),
        }
    }
}

/// What a remediation accomplished. `Recovered` resets the category's
/// failure tally; `BackedOff` (a pure cooldown) leaves it standing, so
/// repeated failures of the same category still accumulate toward the
/// breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyOutcome {
    Recovered,
    BackedOff,
}

/// Category-specific remediation.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync + 'static {
    async fn run(&self, error: &RealtimeError) -> Result<StrategyOutcome, RealtimeError>;
}

type EscalationCallback = Arc<dyn Fn(ErrorCategory) + Send + Sync>;

/// Classifies failures by category, runs the registered remediation, and
/// escalates to a circuit-breaker cooldown after a repeat-failure
/// threshold. While a breaker is open every call for that category is
/// rejected with [`RealtimeError::CircuitOpen`]; once the cooldown
/// elapses the tally resets and strategies run again.
pub struct RecoveryCoordinator {
    config: RecoveryConfig,
    strategies: RwLock<HashMap<ErrorCategory, Arc<dyn RecoveryStrategy>>>,
    tallies: Mutex<HashMap<ErrorCategory, u32>>,
    breakers: Mutex<HashMap<ErrorCategory, Instant>>,
    on_escalation: RwLock<Option<EscalationCallback>>,
}

impl RecoveryCoordinator {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            strategies: RwLock::new(HashMap::new()),
            tallies: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            on_escalation: RwLock::new(None),
        }
    }

    /// Register (or override) the remediation for a category.
    pub fn register_strategy(&self, category: ErrorCategory, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.write().insert(category, strategy);
    }

    /// Invoked when a breaker opens, so the UI can render an actionable
    /// state.
    pub fn set_on_escalation(&self, callback: EscalationCallback) {
        *self.on_escalation.write() = Some(callback);
    }

    /// Collaborating subsystems report demonstrable recovery here to
    /// reset the category's tally without waiting for a strategy run.
    pub fn record_success(&self, category: ErrorCategory) {
        self.tallies.lock().insert(category, 0);
    }

    pub fn consecutive_failures(&self, category: ErrorCategory) -> u32 {
        self.tallies.lock().get(&category).copied().unwrap_or(0)
    }

    pub fn breaker_open(&self, category: ErrorCategory) -> bool {
        self.breakers
            .lock()
            .get(&category)
            .is_some_and(|opened| opened.elapsed() < self.config.breaker_cooldown)
    }

    pub async fn handle_error(
        &self,
        category: ErrorCategory,
        error: &RealtimeError,
    ) -> Result<StrategyOutcome, RealtimeError> {
        {
            let mut breakers = self.breakers.lock();
            if let Some(opened) = breakers.get(&category).copied() {
                if opened.elapsed() < self.config.breaker_cooldown {
                    debug!(%category, "recovery suppressed while breaker is open");
                    return Err(RealtimeError::CircuitOpen { category });
                }
                breakers.remove(&category);
                self.tallies.lock().insert(category, 0);
                info!(%category, "circuit breaker closed after cooldown");
            }
        }

        let count = {
            let mut tallies = self.tallies.lock();
            let count = tallies.entry(category).or_insert(0);
            *count += 1;
            *count
        };

        if count > self.config.failure_threshold {
            warn!(
                %category,
                failures = count,
                cooldown_secs = self.config.breaker_cooldown.as_secs(),
                "repeat-failure threshold reached, opening circuit breaker"
            );
            self.breakers.lock().insert(category, Instant::now());
            let callback = self.on_escalation.read().clone();
            if let Some(callback) = callback {
                callback(category);
            }
            return Err(RealtimeError::CircuitOpen { category });
        }

        let strategy = self.strategies.read().get(&category).cloned();
        let Some(strategy) = strategy else {
            warn!(%category, error = %error, "no recovery strategy registered");
            return Ok(StrategyOutcome::BackedOff);
        };

        match strategy.run(error).await {
            Ok(StrategyOutcome::Recovered) => {
                self.tallies.lock().insert(category, 0);
                debug!(%category, "recovery strategy succeeded");
                Ok(StrategyOutcome::Recovered)
            }
            Ok(StrategyOutcome::BackedOff) => Ok(StrategyOutcome::BackedOff),
            Err(e) => {
                warn!(%category, error = %e, "recovery strategy failed");
                Err(e)
            }
        }
    }
}
