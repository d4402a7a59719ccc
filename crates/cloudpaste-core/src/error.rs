use serde::Serialize;

/// Why an authorization policy denied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Unauthenticated,
    MissingPermission,
    PathScope,
    CustomCheck,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Unauthenticated => "unauthenticated",
            DenyReason::MissingPermission => "missing_permission",
            DenyReason::PathScope => "path_scope",
            DenyReason::CustomCheck => "custom_check",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream storage failure. Carries enough structure for the retry
/// classifier: an error code, an optional HTTP status from the backing
/// store, an optional explicit retryability hint and the wrapped cause.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DriverError {
    pub code: String,
    pub message: String,
    pub http_status: Option<u16>,
    pub retryable: Option<bool>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DriverError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            http_status: None,
            retryable: None,
            source: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message).with_status(404)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("FORBIDDEN", message).with_status(403)
    }
}

impl From<std::io::Error> for DriverError {
    fn from(error: std::io::Error) -> Self {
        let code = match error.kind() {
            std::io::ErrorKind::NotFound => "NOT_FOUND",
            std::io::ErrorKind::PermissionDenied => "FORBIDDEN",
            std::io::ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            std::io::ErrorKind::TimedOut => "TIMEOUT",
            _ => "IO_ERROR",
        };
        Self::new(code, error.to_string()).with_source(error)
    }
}

/// Application error taxonomy. The HTTP adapter translates variants to the
/// standard `{code, message, success:false, data:null}` envelope; everything
/// below the transport propagates these with `?`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthenticated(String),
    #[error("forbidden ({reason}): {message}")]
    Forbidden { reason: DenyReason, message: String },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("{code}: {message}")]
    Streaming { code: &'static str, message: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn forbidden(reason: DenyReason, message: impl Into<String>) -> Self {
        AppError::Forbidden {
            reason,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        AppError::Conflict(message.into())
    }

    pub fn streaming(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Streaming {
            code,
            message: message.into(),
        }
    }

    /// HTTP status this error renders as.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Validation(_) => 400,
            AppError::Unauthenticated(_) => 401,
            AppError::Forbidden { .. } => 403,
            AppError::NotFound(_) => 404,
            AppError::Conflict(_) => 409,
            AppError::PayloadTooLarge(_) => 413,
            AppError::NotImplemented(_) => 501,
            AppError::Driver(e) => match e.code.as_str() {
                c if c.contains("NOT_FOUND") => 404,
                c if c.contains("FORBIDDEN") => 403,
                _ => 500,
            },
            AppError::Streaming { code, .. } => {
                if code.contains("NOT_FOUND") {
                    404
                } else if code.contains("FORBIDDEN") {
                    403
                } else {
                    500
                }
            }
            AppError::Internal(_) => 500,
        }
    }

    /// Short machine code used by transports and audit logs.
    pub fn code(&self) -> &str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Unauthenticated(_) => "unauthenticated",
            AppError::Forbidden { reason, .. } => reason.as_str(),
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::NotImplemented(_) => "not_implemented",
            AppError::Driver(e) => &e.code,
            AppError::Streaming { code, .. } => code,
            AppError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(AppError::validation("x").status_code(), 400);
        assert_eq!(AppError::Unauthenticated("x".into()).status_code(), 401);
        assert_eq!(
            AppError::forbidden(DenyReason::PathScope, "x").status_code(),
            403
        );
        assert_eq!(AppError::not_found("x").status_code(), 404);
        assert_eq!(AppError::conflict("x").status_code(), 409);
        assert_eq!(AppError::NotImplemented("rename").status_code(), 501);
        assert_eq!(
            AppError::Driver(DriverError::not_found("gone")).status_code(),
            404
        );
        assert_eq!(
            AppError::streaming("STREAMING_ERROR.INVALID_DOWNLOAD_RESULT", "x").status_code(),
            500
        );
    }

    #[test]
    fn driver_error_keeps_source_chain() {
        let io = std::io::Error::from(std::io::ErrorKind::TimedOut);
        let err = DriverError::from(io);
        assert_eq!(err.code, "TIMEOUT");
        assert!(std::error::Error::source(&err).is_some());
    }
}
