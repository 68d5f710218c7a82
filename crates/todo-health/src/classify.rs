use crate::probe::ProbeFailure;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QuotaExceeded,
    NetworkError,
    OperationFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::OperationFailed => "operation_failed",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, ErrorKind::NetworkError)
    }

    pub fn resolution(&self) -> &'static str {
        match self {
            ErrorKind::QuotaExceeded => {
                "Free up storage space by removing old todos or attachments"
            }
            ErrorKind::NetworkError => "Check your connection; the store will be retried",
            ErrorKind::OperationFailed => "Reload the application or contact support",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify_failure(failure: &ProbeFailure) -> ErrorKind {
    match failure {
        ProbeFailure::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
        ProbeFailure::Network(_) | ProbeFailure::Timeout(_) => ErrorKind::NetworkError,
        ProbeFailure::Other(message) => classify_message(message),
    }
}

/// Backends that only hand over a message still get a best-effort kind.
fn classify_message(message: &str) -> ErrorKind {
    let lowered = message.to_lowercase();
    if lowered.contains("quota") || lowered.contains("disk is full") {
        ErrorKind::QuotaExceeded
    } else if ["network", "fetch", "offline", "connection", "timed out"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        ErrorKind::NetworkError
    } else {
        ErrorKind::OperationFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn typed_failures_map_directly() {
        assert_eq!(
            classify_failure(&ProbeFailure::QuotaExceeded("full".to_string())),
            ErrorKind::QuotaExceeded
        );
        assert_eq!(
            classify_failure(&ProbeFailure::Timeout(Duration::from_secs(10))),
            ErrorKind::NetworkError
        );
        assert_eq!(
            classify_failure(&ProbeFailure::Network("reset".to_string())),
            ErrorKind::NetworkError
        );
    }

    #[test]
    fn untyped_failures_are_classified_by_message() {
        let classify = |message: &str| classify_failure(&ProbeFailure::Other(message.to_string()));
        assert_eq!(classify("QuotaExceededError"), ErrorKind::QuotaExceeded);
        assert_eq!(classify("Failed to fetch"), ErrorKind::NetworkError);
        assert_eq!(classify("no such table: documents"), ErrorKind::OperationFailed);
    }

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(ErrorKind::NetworkError.retryable());
        assert!(!ErrorKind::QuotaExceeded.retryable());
        assert!(!ErrorKind::OperationFailed.retryable());
    }
}
