use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use cloudpaste_core::AppError;

/// Transport wrapper around the application error taxonomy. Every failure
/// renders the standard `{code, message, success:false, data:null}`
/// envelope with the matching HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: u16,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code: status.as_u16(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

fn from_app_error(error: &AppError) -> ApiError {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %error, code = error.code(), "request failed");
        "Internal server error".to_string()
    } else {
        tracing::debug!(error = %error, code = error.code(), "request rejected");
        error.to_string()
    };
    ApiError {
        status,
        code: status.as_u16(),
        message,
    }
}

impl From<AppError> for ApiError {
    fn from(error: AppError) -> Self {
        from_app_error(&error)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        // Surface a typed AppError if one is buried in the chain.
        for cause in error.chain() {
            if let Some(app) = cause.downcast_ref::<AppError>() {
                return from_app_error(app);
            }
        }
        tracing::error!(error = %error, "request failed");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        ApiError::from(anyhow::Error::new(error))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct Envelope {
            code: u16,
            message: String,
            success: bool,
            data: Option<()>,
        }

        let body = Json(Envelope {
            code: self.code,
            message: self.message,
            success: false,
            data: None,
        });
        (self.status, body).into_response()
    }
}

/// Success envelope used by JSON endpoints.
pub fn ok_envelope<T: Serialize>(message: &str, data: T) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "code": 200,
        "success": true,
        "message": message,
        "data": data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudpaste_core::DenyReason;

    #[test]
    fn app_errors_map_to_envelope_statuses() {
        let api: ApiError = AppError::validation("bad").into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert_eq!(api.code, 400);

        let api: ApiError = AppError::forbidden(DenyReason::PathScope, "scope").into();
        assert_eq!(api.status, StatusCode::FORBIDDEN);

        let api: ApiError = AppError::conflict("dup").into();
        assert_eq!(api.status, StatusCode::CONFLICT);
    }

    #[test]
    fn buried_app_error_is_recovered_from_anyhow() {
        let inner = AppError::not_found("missing");
        let wrapped = anyhow::Error::new(inner).context("while handling request");
        let api: ApiError = wrapped.into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn internal_errors_hide_details() {
        let api: ApiError = anyhow::anyhow!("secret db path").into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.message, "Internal server error");
    }
}
