//! Error taxonomy for the resilience engine.
//!
//! Two layers of errors exist:
//! - [`OpError`] is the shape a protected operation fails with. It is the
//!   only thing a service's error classifier ever sees.
//! - [`ResilienceError`] is what the engine itself surfaces to callers:
//!   fail-fast rejections, storm-protection aborts, exhausted fallback
//!   chains, and the underlying operation error passed through unchanged.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::service::{CircuitState, ClassifierFn};

/// Closed classification of an operation error.
///
/// The classification decides retry and circuit-breaking eligibility,
/// independent of the originating vendor's error shape. Only a service's
/// classifier produces these; the engine never sniffs raw error fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Retryable,
    NonRetryable,
    Throttling,
    CircuitBreaker,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    ServiceUnavailable,
    Network,
}

impl ErrorKind {
    /// Whether the retry loop may attempt the operation again.
    ///
    /// Authentication, authorization, validation, not-found, and conflict
    /// failures are terminal: retrying them cannot change the outcome.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Retryable
                | Self::Throttling
                | Self::CircuitBreaker
                | Self::ServiceUnavailable
                | Self::Network
        )
    }

    /// Whether a failure of this kind counts toward opening a circuit.
    ///
    /// Circuit-breaker rejections are excluded: the breaker that produced
    /// them must not feed on its own output.
    pub fn counts_as_failure(self) -> bool {
        matches!(
            self,
            Self::Retryable | Self::Throttling | Self::ServiceUnavailable | Self::Network
        )
    }

    /// Backoff delay multiplier applied before the exponential term.
    ///
    /// Throttled calls back off harder; calls rejected by an open circuit
    /// wait out part of the reset window.
    pub fn delay_multiplier(self) -> f64 {
        match self {
            Self::Throttling => 3.0,
            Self::CircuitBreaker => 2.0,
            _ => 1.0,
        }
    }

    /// Stable string form, used as a map key in exported metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "RETRYABLE",
            Self::NonRetryable => "NON_RETRYABLE",
            Self::Throttling => "THROTTLING",
            Self::CircuitBreaker => "CIRCUIT_BREAKER",
            Self::Authentication => "AUTHENTICATION",
            Self::Authorization => "AUTHORIZATION",
            Self::Validation => "VALIDATION",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Network => "NETWORK",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error shape a protected operation fails with.
///
/// Callers adapt their vendor errors into this before handing an operation
/// to the engine; the service's classifier maps it to an [`ErrorKind`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct OpError {
    /// Error class name, if the source distinguishes one.
    pub name: Option<String>,

    /// Vendor or transport error code.
    pub code: Option<String>,

    /// Human-readable message.
    pub message: String,

    /// HTTP status, when the failure came off the wire.
    pub status: Option<u16>,
}

impl OpError {
    /// Create an error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            code: None,
            message: message.into(),
            status: None,
        }
    }

    /// Attach an error class name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach a vendor or transport error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach an HTTP status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Errors surfaced by the resilience engine.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// The circuit for this service is rejecting calls without invoking
    /// the operation.
    #[error("circuit breaker for {service} is {state}, failing fast")]
    CircuitOpen {
        service: String,
        state: CircuitState,
    },

    /// The call waited in the rate limiter's admission queue longer than
    /// the fairness bound allows.
    #[error("rate limiter admission for {service} expired after {waited:?} in queue")]
    RateLimitExpired { service: String, waited: Duration },

    /// The rate limiter was shut down while this call was queued.
    #[error("rate limiter for {service} was shut down while waiting for admission")]
    RateLimiterClosed { service: String },

    /// Storm protection: the service's shared retry budget for the current
    /// window is spent. Distinct from exhausting a single call's attempts.
    #[error("global retry budget for {service} exhausted ({used} retries in the current {window:?} window)")]
    GlobalRetryLimitExceeded {
        service: String,
        used: u32,
        window: Duration,
    },

    /// Every registered fallback for a degraded service raised.
    #[error("all {attempted} fallbacks for {service} failed")]
    AllFallbacksFailed {
        service: String,
        attempted: usize,
        reasons: Vec<String>,
    },

    /// A fallback produced a value the caller's type could not absorb.
    #[error("fallback for {service} produced an incompatible value: {reason}")]
    FallbackDecode { service: String, reason: String },

    /// No configuration is registered under this service name.
    #[error("no service named {0} is registered")]
    UnknownService(String),

    /// The protected operation's own error, passed through unchanged.
    #[error(transparent)]
    Operation(#[from] OpError),
}

impl ResilienceError {
    /// Classify this error for retry decisions.
    ///
    /// Operation errors go through the service's classifier; the engine's
    /// own errors have fixed classifications.
    pub fn classify(&self, classifier: &ClassifierFn) -> ErrorKind {
        match self {
            Self::Operation(inner) => classifier(inner),
            Self::CircuitOpen { .. } => ErrorKind::CircuitBreaker,
            Self::AllFallbacksFailed { .. } => ErrorKind::ServiceUnavailable,
            Self::RateLimitExpired { .. } => ErrorKind::Throttling,
            Self::RateLimiterClosed { .. }
            | Self::GlobalRetryLimitExceeded { .. }
            | Self::FallbackDecode { .. }
            | Self::UnknownService(_) => ErrorKind::NonRetryable,
        }
    }

    /// The service this error concerns, when one is identifiable.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { service, .. }
            | Self::RateLimitExpired { service, .. }
            | Self::RateLimiterClosed { service }
            | Self::GlobalRetryLimitExceeded { service, .. }
            | Self::AllFallbacksFailed { service, .. }
            | Self::FallbackDecode { service, .. } => Some(service),
            Self::UnknownService(name) => Some(name),
            Self::Operation(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_terminal_kinds_are_not_retryable() {
        for kind in [
            ErrorKind::NonRetryable,
            ErrorKind::Authentication,
            ErrorKind::Authorization,
            ErrorKind::Validation,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
        ] {
            assert!(!kind.is_retryable(), "{kind} should be terminal");
            assert!(!kind.counts_as_failure());
        }
    }

    #[test]
    fn test_circuit_breaker_kind_retries_but_never_counts() {
        assert!(ErrorKind::CircuitBreaker.is_retryable());
        assert!(!ErrorKind::CircuitBreaker.counts_as_failure());
    }

    #[test]
    fn test_delay_multipliers() {
        assert_eq!(ErrorKind::Throttling.delay_multiplier(), 3.0);
        assert_eq!(ErrorKind::CircuitBreaker.delay_multiplier(), 2.0);
        assert_eq!(ErrorKind::Retryable.delay_multiplier(), 1.0);
    }

    #[test]
    fn test_op_error_builder() {
        let err = OpError::new("boom")
            .with_code("ETIMEDOUT")
            .with_status(504)
            .with_name("GatewayTimeout");
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.code.as_deref(), Some("ETIMEDOUT"));
        assert_eq!(err.status, Some(504));
    }

    #[test]
    fn test_classify_engine_errors() {
        let classifier: ClassifierFn = Arc::new(|_| ErrorKind::Validation);

        let open = ResilienceError::CircuitOpen {
            service: "PAYMENTS".into(),
            state: CircuitState::Open,
        };
        assert_eq!(open.classify(&classifier), ErrorKind::CircuitBreaker);

        let op = ResilienceError::Operation(OpError::new("bad input"));
        assert_eq!(op.classify(&classifier), ErrorKind::Validation);

        let storm = ResilienceError::GlobalRetryLimitExceeded {
            service: "PAYMENTS".into(),
            used: 20,
            window: Duration::from_secs(60),
        };
        assert_eq!(storm.classify(&classifier), ErrorKind::NonRetryable);
    }

    #[test]
    fn test_kind_serde_round_trip() {
        let json = serde_json::to_string(&ErrorKind::ServiceUnavailable).unwrap();
        assert_eq!(json, "\"SERVICE_UNAVAILABLE\"");
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::ServiceUnavailable);
    }
}
