// =============================================================================
// Engine Error Taxonomy — kinds, not call sites
// =============================================================================
//
// Every failure in the engine is classified into one of six kinds:
//
//   Transient     — network glitch, rate-limit exhaustion, provider 5xx.
//                   Recovered locally with backoff or a fallback adapter.
//   Validation    — schema mismatch, risk-limit violation. Recorded into the
//                   cycle state as a per-symbol or per-cycle skip.
//   Configuration — missing credentials, unknown plugin, cyclic workflow.
//                   The bot transitions to `error` and does not auto-restart.
//   Fatal         — durable store unreachable, exchange auth revoked.
//   Timeout       — a bounded wait expired. First-class so the LLM fallback
//                   machinery can pattern-match on it.
//   Cancelled     — a stop signal pre-empted the operation.
//
// Recovery happens at the lowest layer capable of it: the exchange client
// retries Transient, the debate engine falls back on Timeout, the scheduler
// records Validation, the supervisor handles Fatal.
// =============================================================================

use std::time::Duration;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Classified engine failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Recoverable at the call site with backoff or a fallback.
    #[error("transient: {0}")]
    Transient(String),

    /// Bad input or a violated business rule; the cycle continues.
    #[error("validation: {0}")]
    Validation(String),

    /// Broken wiring; requires operator action.
    #[error("configuration: {0}")]
    Configuration(String),

    /// The bot cannot continue.
    #[error("fatal: {0}")]
    Fatal(String),

    /// A bounded wait expired.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The operation was pre-empted by a stop signal.
    #[error("cancelled")]
    Cancelled,
}

/// Coarse classification label, used for retry decisions and cycle records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Validation,
    Configuration,
    Fatal,
    Timeout,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Validation => "validation",
            Self::Configuration => "configuration",
            Self::Fatal => "fatal",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl EngineError {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Fatal(_) => ErrorKind::Fatal,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a caller is allowed to retry this failure in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// Whether the bot must stop looping on this failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Configuration(_))
    }
}

// ---------------------------------------------------------------------------
// Conversions from library errors
// ---------------------------------------------------------------------------

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            // A busy pool is a Transient condition, not a lost store.
            sqlx::Error::PoolTimedOut => {
                Self::Transient("database pool exhausted".to_string())
            }
            sqlx::Error::RowNotFound => {
                Self::Validation("requested row does not exist".to_string())
            }
            other => Self::Fatal(format!("database error: {other}")),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            // reqwest does not expose the configured deadline; report zero and
            // let callers that know the deadline attach it themselves.
            Self::Timeout(Duration::ZERO)
        } else if let Some(status) = e.status() {
            Self::from_http_status(status.as_u16(), e.to_string())
        } else {
            Self::Transient(format!("http transport error: {e}"))
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(format!("json: {e}"))
    }
}

impl EngineError {
    /// Classify an HTTP status code per the taxonomy: 401/403 are
    /// configuration problems (bad credentials), 4xx are validation,
    /// everything else on the error side is transient.
    pub fn from_http_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Configuration(format!("http {status}: {body}")),
            429 => Self::Transient(format!("http 429 (rate limited): {body}")),
            400..=499 => Self::Validation(format!("http {status}: {body}")),
            _ => Self::Transient(format!("http {status}: {body}")),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_one_to_one() {
        assert_eq!(EngineError::Transient(String::new()).kind(), ErrorKind::Transient);
        assert_eq!(EngineError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            EngineError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn retryable_is_transient_or_timeout() {
        assert!(EngineError::Transient("x".into()).is_retryable());
        assert!(EngineError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!EngineError::Validation("x".into()).is_retryable());
        assert!(!EngineError::Fatal("x".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }

    #[test]
    fn http_status_classification() {
        assert_eq!(
            EngineError::from_http_status(401, "no".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            EngineError::from_http_status(429, "slow down".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            EngineError::from_http_status(422, "bad payload".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            EngineError::from_http_status(503, "maintenance".into()).kind(),
            ErrorKind::Transient
        );
    }

    #[test]
    fn configuration_errors_are_fatal_for_the_loop() {
        assert!(EngineError::Configuration("unknown plugin".into()).is_fatal());
        assert!(EngineError::Fatal("store gone".into()).is_fatal());
        assert!(!EngineError::Validation("skip".into()).is_fatal());
    }
}
