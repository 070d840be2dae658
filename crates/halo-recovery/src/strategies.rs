use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use halo_core::RealtimeError;
use halo_transport::{ConnectionService, CredentialProvider, HealthMonitor};

use crate::recovery::{RecoveryStrategy, StrategyOutcome};

/// Authentication remediation: prove a fresh credential can be fetched,
/// then cycle the connection so the next handshake uses it.
pub struct CredentialRefreshStrategy {
    credentials: Arc<dyn CredentialProvider>,
    connection: Arc<ConnectionService>,
}

impl CredentialRefreshStrategy {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        connection: Arc<ConnectionService>,
    ) -> Self {
        Self {
            credentials,
            connection,
        }
    }
}

#[async_trait]
impl RecoveryStrategy for CredentialRefreshStrategy {
    async fn run(&self, _error: &RealtimeError) -> Result<StrategyOutcome, RealtimeError> {
        self.credentials.access_token().await?;
        info!("credential refreshed, cycling connection");
        self.connection.force_reconnect();
        Ok(StrategyOutcome::Recovered)
    }
}

/// Transport remediation: let the health monitor cycle the link.
pub struct ForceReconnectStrategy {
    health: Arc<HealthMonitor>,
}

impl ForceReconnectStrategy {
    pub fn new(health: Arc<HealthMonitor>) -> Self {
        Self { health }
    }
}

#[async_trait]
impl RecoveryStrategy for ForceReconnectStrategy {
    async fn run(&self, _error: &RealtimeError) -> Result<StrategyOutcome, RealtimeError> {
        self.health.force_reconnect();
        Ok(StrategyOutcome::Recovered)
    }
}

/// Rate-limit remediation: a fixed cooldown (or the server's hint when it
/// carries one), no retry counting.
pub struct CooldownStrategy {
    cooldown: Duration,
}

impl CooldownStrategy {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }
}

#[async_trait]
impl RecoveryStrategy for CooldownStrategy {
    async fn run(&self, error: &RealtimeError) -> Result<StrategyOutcome, RealtimeError> {
        let cooldown = error.suggested_delay().unwrap_or(self.cooldown);
        debug!(cooldown_secs = cooldown.as_secs(), "cooling down");
        tokio::time::sleep(cooldown).await;
        Ok(StrategyOutcome::BackedOff)
    }
}

/// Delivery remediation: a short fixed backoff before the caller retries.
pub struct BackoffStrategy {
    backoff: Duration,
}

impl BackoffStrategy {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }
}

#[async_trait]
impl RecoveryStrategy for BackoffStrategy {
    async fn run(&self, _error: &RealtimeError) -> Result<StrategyOutcome, RealtimeError> {
        tokio::time::sleep(self.backoff).await;
        Ok(StrategyOutcome::BackedOff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cooldown_prefers_the_server_hint() {
        let strategy = CooldownStrategy::new(Duration::from_secs(30));
        let started = tokio::time::Instant::now();
        let outcome = strategy
            .run(&RealtimeError::RateLimited {
                retry_after: Some(Duration::from_secs(5)),
            })
            .await
            .unwrap();
        assert_eq!(outcome, StrategyOutcome::BackedOff);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_the_configured_gap() {
        let strategy = BackoffStrategy::new(Duration::from_secs(2));
        let started = tokio::time::Instant::now();
        strategy
            .run(&RealtimeError::DeliveryExhausted { attempts: 3 })
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }
}
