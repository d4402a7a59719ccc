//! Retryability classification for copy-item failures. First match wins:
//! an explicit hint, then HTTP status sets, then code/message patterns,
//! then the wrapped cause chain; anything unmatched is terminal.

use cloudpaste_core::{AppError, DriverError};

const NON_RETRYABLE_STATUS: &[u16] = &[400, 401, 403, 404, 405, 409, 410, 413, 415, 422];
const RETRYABLE_STATUS: &[u16] = &[408, 425, 429, 500, 502, 503, 504, 507, 509];

const RETRYABLE_PATTERNS: &[&str] = &[
    "TIMEOUT",
    "ECONNRESET",
    "ECONNREFUSED",
    "ENOTFOUND",
    "ETIMEDOUT",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "EPIPE",
    "THROTTL",
    "RATE_LIMIT",
    "TOO_MANY",
    "BUSY",
    "NETWORK",
    "SOCKET",
    "CONNECTION",
    "DNS",
    "SLOWDOWN",
    "INTERNAL_ERROR",
    "SERVICE_EXCEPTION",
    "REQUEST_TIMEOUT",
    "OPERATION_ABORTED",
];

fn text_matches(text: &str) -> bool {
    let upper = text.to_uppercase();
    RETRYABLE_PATTERNS.iter().any(|p| upper.contains(p))
}

fn classify_driver(error: &DriverError) -> bool {
    if let Some(retryable) = error.retryable {
        return retryable;
    }

    if let Some(status) = error.http_status {
        if NON_RETRYABLE_STATUS.contains(&status) {
            return false;
        }
        if RETRYABLE_STATUS.contains(&status) {
            return true;
        }
    }

    if text_matches(&error.code) || text_matches(&error.message) {
        return true;
    }

    // Unwrap the cause chain and recurse.
    let mut cause = error.source.as_deref().map(|e| e as &(dyn std::error::Error));
    while let Some(inner) = cause {
        if let Some(driver) = inner.downcast_ref::<DriverError>() {
            return classify_driver(driver);
        }
        if text_matches(&inner.to_string()) {
            return true;
        }
        cause = inner.source();
    }

    false
}

pub fn is_retryable(error: &AppError) -> bool {
    match error {
        AppError::Driver(driver) => classify_driver(driver),
        AppError::Internal(inner) => inner.chain().any(|cause| {
            if let Some(driver) = cause.downcast_ref::<DriverError>() {
                classify_driver(driver)
            } else {
                text_matches(&cause.to_string())
            }
        }),
        AppError::Streaming { code, message } => text_matches(code) || text_matches(message),
        // Policy, validation and not-found failures never resolve by retry.
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_hint_wins_over_everything() {
        let err = DriverError::new("ECONNRESET", "reset").with_retryable(false);
        assert!(!classify_driver(&err));
        let err = DriverError::new("PLAIN", "plain").with_retryable(true);
        assert!(classify_driver(&err));
    }

    #[test]
    fn status_sets_are_decisive() {
        assert!(!classify_driver(&DriverError::new("X", "x").with_status(404)));
        assert!(!classify_driver(&DriverError::new("X", "x").with_status(422)));
        assert!(classify_driver(&DriverError::new("X", "x").with_status(503)));
        assert!(classify_driver(&DriverError::new("X", "x").with_status(429)));
    }

    #[test]
    fn non_retryable_status_beats_retryable_pattern() {
        // 404 with a "NETWORK" message: the status rule fires first.
        let err = DriverError::new("X", "network glitch").with_status(404);
        assert!(!classify_driver(&err));
    }

    #[test]
    fn code_and_message_patterns() {
        assert!(classify_driver(&DriverError::new("ECONNRESET", "peer reset")));
        assert!(classify_driver(&DriverError::new("X", "SlowDown please")));
        assert!(classify_driver(&DriverError::new("X", "dns lookup failed")));
        assert!(!classify_driver(&DriverError::new("NO_SUCH_KEY", "missing")));
    }

    #[test]
    fn cause_chain_is_unwrapped() {
        let io = std::io::Error::other("connection reset by peer (ECONNRESET)");
        let err = DriverError::new("WRAPPER", "copy failed").with_source(io);
        assert!(classify_driver(&err));

        let inner = DriverError::new("X", "x").with_status(410);
        let outer = DriverError::new("WRAPPER", "copy failed").with_source(inner);
        assert!(!classify_driver(&outer));
    }

    #[test]
    fn app_error_taxonomy() {
        assert!(!is_retryable(&AppError::validation("bad payload")));
        assert!(!is_retryable(&AppError::not_found("gone")));
        assert!(is_retryable(&AppError::Driver(
            DriverError::new("X", "x").with_status(502)
        )));
        assert!(is_retryable(&AppError::Internal(anyhow::anyhow!(
            "request timeout while fetching"
        ))));
    }
}
