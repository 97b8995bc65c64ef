use std::time::Duration;

use thiserror::Error;

/// Failure reported by an external capability.
///
/// The variants carry the retry classification the job engine needs:
/// transient faults may succeed on a later attempt, permanent ones never will.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// The call did not complete within its time budget.
    #[error("capability call timed out after {0:?}")]
    Timeout(Duration),

    /// The service asked us to slow down (HTTP 429 or equivalent).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Network failure, 5xx, or other noise a repeat call may not see.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The service rejected the input itself (bad media, unsupported format).
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The service answered but the payload could not be understood.
    ///
    /// `structural` marks a schema mismatch between what we asked for and
    /// what the service produces; repeating the call cannot fix that.
    #[error("malformed response: {message}")]
    Malformed { message: String, structural: bool },
}

impl CapabilityError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed {
            message: msg.into(),
            structural: false,
        }
    }

    pub fn structural(msg: impl Into<String>) -> Self {
        Self::Malformed {
            message: msg.into(),
            structural: true,
        }
    }

    /// Whether a later attempt of the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CapabilityError::Timeout(_)
            | CapabilityError::RateLimited(_)
            | CapabilityError::Transient(_) => true,
            CapabilityError::Permanent(_) => false,
            CapabilityError::Malformed { structural, .. } => !structural,
        }
    }
}

/// Failure delivering a notification. Always logged and discarded by callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification_follows_taxonomy() {
        assert!(CapabilityError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(CapabilityError::RateLimited("slow down".into()).is_retryable());
        assert!(CapabilityError::transient("502").is_retryable());
        assert!(CapabilityError::malformed("truncated json").is_retryable());

        assert!(!CapabilityError::permanent("unsupported codec").is_retryable());
        assert!(!CapabilityError::structural("missing `scores` field").is_retryable());
    }
}
