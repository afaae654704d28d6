use std::fmt;

/// Stable error kinds, mapped to HTTP status codes at whatever boundary
/// ends up serving this crate (an HTTP framework is not part of this crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    PlanUnavailable,
    UserNotFound,
    InvalidOrderStatus,
    PaymentError,
    InvalidSignature,
    TransactionFailed,
    MaxRetries,
    ProviderError,
    ExternalServiceError,
    RateLimitExceeded,
    Internal,
}

impl ErrorKind {
    /// The HTTP status code an edge server would surface for this kind.
    pub fn status_hint(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::PlanUnavailable => 400,
            ErrorKind::UserNotFound => 400,
            ErrorKind::InvalidOrderStatus => 400,
            ErrorKind::PaymentError => 402,
            ErrorKind::InvalidSignature => 400,
            ErrorKind::TransactionFailed => 500,
            ErrorKind::MaxRetries => 400,
            ErrorKind::ProviderError => 500,
            ErrorKind::ExternalServiceError => 502,
            ErrorKind::RateLimitExceeded => 429,
            ErrorKind::Internal => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::PlanUnavailable => "PLAN_UNAVAILABLE",
            ErrorKind::UserNotFound => "USER_NOT_FOUND",
            ErrorKind::InvalidOrderStatus => "INVALID_ORDER_STATUS",
            ErrorKind::PaymentError => "PAYMENT_ERROR",
            ErrorKind::InvalidSignature => "INVALID_SIGNATURE",
            ErrorKind::TransactionFailed => "TRANSACTION_FAILED",
            ErrorKind::MaxRetries => "MAX_RETRIES",
            ErrorKind::ProviderError => "PROVIDER_ERROR",
            ErrorKind::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The discriminated result every orchestrator-level operation returns.
/// Only programmer errors (e.g. a poisoned internal invariant) panic;
/// everything expected flows through here.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    /// Present only when running with a development configuration
    /// (spec: sensitive upstream detail is not leaked by default).
    pub details: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Wraps an adapter-raised error, preserving provider attribution.
    pub fn from_provider(slug: &str, message: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::ProviderError,
            format!("provider '{slug}': {message}"),
        )
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{what} not found"))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn invalid_order_status(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOrderStatus, message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
