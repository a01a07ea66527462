use axum::Json;
use axum::http::header::WWW_AUTHENTICATE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::telemetry::{CORRELATION_ID_HEADER, CorrelationId, correlation_header_value};

#[derive(Debug, Error)]
pub enum AppErrorKind {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Gone(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Error)]
#[error("{kind}")]
pub struct AppError {
    kind: AppErrorKind,
    correlation_id: Option<String>,
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            correlation_id: None,
        }
    }

    pub fn kind(&self) -> &AppErrorKind {
        &self.kind
    }

    pub fn with_correlation(mut self, id: String) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn bad_request<T: Into<String>>(message: T) -> Self {
        Self::new(AppErrorKind::BadRequest(message.into()))
    }

    pub fn unauthorized<T: Into<String>>(message: T) -> Self {
        Self::new(AppErrorKind::Unauthorized(message.into()))
    }

    /// Unknown bindings are reported as gone on unbind.
    pub fn gone_if_not_found(self) -> Self {
        match self.kind {
            AppErrorKind::NotFound(message) => Self {
                kind: AppErrorKind::Gone(message),
                correlation_id: self.correlation_id,
            },
            _ => self,
        }
    }

    fn status(&self) -> StatusCode {
        match self.kind {
            AppErrorKind::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppErrorKind::NotFound(_) => StatusCode::NOT_FOUND,
            AppErrorKind::Gone(_) => StatusCode::GONE,
            AppErrorKind::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppErrorKind::Conflict(_) => StatusCode::CONFLICT,
            AppErrorKind::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppErrorKind::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self.kind {
            AppErrorKind::BadRequest(_) => "bad_request",
            AppErrorKind::NotFound(_) => "not_found",
            AppErrorKind::Gone(_) => "gone",
            AppErrorKind::Unauthorized(_) => "unauthorized",
            AppErrorKind::Conflict(_) => "conflict",
            AppErrorKind::Unavailable(_) => "unavailable",
            AppErrorKind::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    description: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.code(),
            description: self.kind.to_string(),
        });

        let mut response = (status, body).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"vault-broker\""),
            );
        }
        if let Some(value) = self.correlation_id.as_deref().and_then(correlation_header_value) {
            response.headers_mut().insert(CORRELATION_ID_HEADER, value);
        }
        response
    }
}

impl From<vault_broker_core::Error> for AppError {
    fn from(value: vault_broker_core::Error) -> Self {
        use vault_broker_core::Error;

        let message = value.to_string();
        let kind = match value {
            Error::EmptyComponent { .. } | Error::InvalidComponent { .. } => {
                AppErrorKind::BadRequest(message)
            }
            Error::NotFound { .. } => AppErrorKind::NotFound(message),
            Error::AlreadyExists { .. } => AppErrorKind::Conflict(message),
            Error::NotRunning => AppErrorKind::Unavailable(message),
            Error::Decode { .. } | Error::Backend(_) => AppErrorKind::Internal(message),
        };
        AppError::new(kind)
    }
}

pub fn attach_correlation(err: AppError, correlation: &CorrelationId) -> AppError {
    err.with_correlation(correlation.0.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_statuses() {
        let cases = [
            (vault_broker_core::Error::not_found("instance i"), StatusCode::NOT_FOUND),
            (
                vault_broker_core::Error::AlreadyExists {
                    entity: "binding b".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                vault_broker_core::Error::EmptyComponent { field: "space id" },
                StatusCode::BAD_REQUEST,
            ),
            (
                vault_broker_core::Error::InvalidComponent { field: "binding id" },
                StatusCode::BAD_REQUEST,
            ),
            (vault_broker_core::Error::NotRunning, StatusCode::SERVICE_UNAVAILABLE),
            (
                vault_broker_core::Error::backend("connection refused"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
    }

    #[test]
    fn not_found_becomes_gone() {
        let err = AppError::from(vault_broker_core::Error::not_found("binding b")).gone_if_not_found();
        assert_eq!(err.status(), StatusCode::GONE);
        assert_eq!(err.to_string(), "binding b does not exist");
    }
}
