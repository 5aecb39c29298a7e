// Error taxonomy for the auction engine.
//
// Each layer returns its own concrete error type so callers can match
// exhaustively (a breaker needs to know "was this a RateLimited or a real
// failure", a hub needs to know "do I close the connection or just answer
// with an error frame"). `EngineError` exists only to let `main.rs` and
// other integration points collapse everything into one `anyhow`-compatible
// type at the boundary.

use thiserror::Error;

/// Why a request was rejected, distinguishing the reasons a circuit breaker
/// should treat as a failure (the upstream itself misbehaved) from the ones
/// it shouldn't (the session just isn't valid anymore — retrying instantly
/// won't help and isn't the upstream's fault).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    UpstreamError,
    NotAuthenticated,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpstreamError => write!(f, "upstream error"),
            Self::NotAuthenticated => write!(f, "not authenticated"),
        }
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited")]
    RateLimited,
    #[error("upstream rejected ({0}): {1}")]
    Rejected(RejectionReason, String),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit open")]
    CircuitOpen,
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("authentication required")]
    AuthRequired,
    #[error("invalid bearer token")]
    AuthInvalid,
    #[error("validation error: {0}")]
    Validation(String),
    #[error("rate limited")]
    RateLimited,
    #[error("request timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Breaker(#[from] BreakerError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error("fatal configuration error: {0}")]
    Fatal(String),
}
