use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Typed failure hierarchy for the realtime layer.
///
/// Every variant maps onto one of the five recovery categories; the Error
/// Recovery Coordinator dispatches on [`RealtimeError::category`] rather
/// than on individual variants.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RealtimeError {
    // Transport
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("reconnect failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("not connected")]
    NotConnected,

    // Authentication
    #[error("credential rejected: {0}")]
    CredentialRejected(String),
    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),

    // Protocol (reported by the server inside a live conversation)
    #[error("tool {tool_name} failed: {message}")]
    ToolFailure { tool_name: String, message: String },
    #[error("generation failed: {0}")]
    Generation(String),

    // Delivery
    #[error("unknown {kind}: {id}")]
    UnknownTarget { kind: &'static str, id: String },
    #[error("panel {0} is not bound to a conversation")]
    PanelUnbound(String),
    #[error("delivery abandoned after {attempts} attempts")]
    DeliveryExhausted { attempts: u32 },

    // Rate limiting
    #[error("rate limited by server")]
    RateLimited { retry_after: Option<Duration> },

    // Operational
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("recovery suppressed: circuit open for {category}")]
    CircuitOpen { category: ErrorCategory },
}

/// The five recovery categories of the failure taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transport,
    Authentication,
    Protocol,
    Delivery,
    RateLimit,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Authentication => "authentication",
            Self::Protocol => "protocol",
            Self::Delivery => "delivery",
            Self::RateLimit => "rate_limit",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RealtimeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_)
            | Self::ReconnectExhausted { .. }
            | Self::NotConnected
            | Self::Timeout(_) => ErrorCategory::Transport,
            Self::CredentialRejected(_) | Self::RefreshFailed(_) => ErrorCategory::Authentication,
            Self::ToolFailure { .. } | Self::Generation(_) => ErrorCategory::Protocol,
            Self::UnknownTarget { .. } | Self::PanelUnbound(_) | Self::DeliveryExhausted { .. } => {
                ErrorCategory::Delivery
            }
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::CircuitOpen { category } => *category,
        }
    }

    /// Whether an automatic retry of the failed operation makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::NotConnected | Self::RateLimited { .. } | Self::Timeout(_)
        )
    }

    /// Terminal conditions: retry budgets are spent, only the UI can act.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ReconnectExhausted { .. } | Self::DeliveryExhausted { .. }
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_mapping() {
        assert_eq!(
            RealtimeError::Transport("socket closed".into()).category(),
            ErrorCategory::Transport
        );
        assert_eq!(
            RealtimeError::CredentialRejected("expired".into()).category(),
            ErrorCategory::Authentication
        );
        assert_eq!(
            RealtimeError::Generation("model overloaded".into()).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            RealtimeError::DeliveryExhausted { attempts: 3 }.category(),
            ErrorCategory::Delivery
        );
        assert_eq!(
            RealtimeError::RateLimited { retry_after: None }.category(),
            ErrorCategory::RateLimit
        );
    }

    #[test]
    fn circuit_open_carries_its_category() {
        let err = RealtimeError::CircuitOpen {
            category: ErrorCategory::RateLimit,
        };
        assert_eq!(err.category(), ErrorCategory::RateLimit);
    }

    #[test]
    fn terminal_classification() {
        assert!(RealtimeError::ReconnectExhausted { attempts: 10 }.is_terminal());
        assert!(RealtimeError::DeliveryExhausted { attempts: 3 }.is_terminal());
        assert!(!RealtimeError::NotConnected.is_terminal());
    }

    #[test]
    fn retryable_classification() {
        assert!(RealtimeError::Transport("reset".into()).is_retryable());
        assert!(RealtimeError::RateLimited { retry_after: None }.is_retryable());
        assert!(!RealtimeError::CredentialRejected("nope".into()).is_retryable());
        assert!(!RealtimeError::ReconnectExhausted { attempts: 10 }.is_retryable());
    }

    #[test]
    fn suggested_delay_only_for_rate_limits() {
        let rl = RealtimeError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(30)));
        assert_eq!(RealtimeError::NotConnected.suggested_delay(), None);
    }

    #[test]
    fn category_display() {
        assert_eq!(ErrorCategory::RateLimit.to_string(), "rate_limit");
        assert_eq!(ErrorCategory::Authentication.to_string(), "authentication");
    }
}
