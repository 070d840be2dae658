//! Error recovery coordinator for the halo realtime layer: per-category
//! remediation strategies, consecutive-failure tallies, and the circuit
//! breaker that takes over when a category keeps failing.

pub mod recovery;
pub mod strategies;

use std::sync::Arc;

use halo_core::ErrorCategory;
use halo_transport::{ConnectionService, CredentialProvider, HealthMonitor};

pub use recovery::{RecoveryConfig, RecoveryCoordinator, RecoveryStrategy, StrategyOutcome};
pub use strategies::{
    BackoffStrategy, CooldownStrategy, CredentialRefreshStrategy, ForceReconnectStrategy,
};

/// A coordinator with the default remediation per category: credential
/// refresh for authentication, a forced reconnect for transport, a fixed
/// cooldown for rate limiting, and a short backoff for delivery
/// failures. Protocol errors have no remediation; they surface through
/// the per-conversation event channel instead.
pub fn with_default_strategies(
    config: RecoveryConfig,
    credentials: Arc<dyn CredentialProvider>,
    connection: Arc<ConnectionService>,
    health: Arc<HealthMonitor>,
) -> RecoveryCoordinator {
    let coordinator = RecoveryCoordinator::new(config.clone());
    coordinator.register_strategy(
        ErrorCategory::Authentication,
        Arc::new(CredentialRefreshStrategy::new(credentials, connection)),
    );
    coordinator.register_strategy(
        ErrorCategory::Transport,
        Arc::new(ForceReconnectStrategy::new(health)),
    );
    coordinator.register_strategy(
        ErrorCategory::RateLimit,
        Arc::new(CooldownStrategy::new(config.rate_limit_cooldown)),
    );
    coordinator.register_strategy(
        ErrorCategory::Delivery,
        Arc::new(BackoffStrategy::new(config.message_failure_backoff)),
    );
    coordinator
}
