use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::engine::EngineError;

/// Failures a download or metadata request can end in.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Too many requests, please slow down.")]
    RateLimited { retry_after_seconds: u64 },

    #[error("{0}")]
    EngineFailure(String),

    #[error("Download failed")]
    ResolutionFailure,

    #[error("The download exceeded the time limit. Try another URL or quality.")]
    Timeout,

    #[error("Video too long")]
    VideoTooLong { duration_seconds: u64, max_seconds: u64 },

    #[error("{0}")]
    EngineUnavailable(String),

    #[error("Delivery interrupted: {0}")]
    DeliveryInterrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EngineError> for ServiceError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::NotInstalled(_) | EngineError::Spawn(_) => {
                Self::EngineUnavailable(error.to_string())
            }
            EngineError::InvalidMetadata(_) | EngineError::Io(_) => {
                Self::EngineFailure(error.to_string())
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_seconds: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: message.into(),
            code: Some("RATE_LIMITED"),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        let message = error.to_string();
        match error {
            ServiceError::RateLimited {
                retry_after_seconds,
            } => Self::rate_limited(message, retry_after_seconds),
            ServiceError::InvalidRequest(_)
            | ServiceError::EngineFailure(_)
            | ServiceError::ResolutionFailure
            | ServiceError::Timeout
            | ServiceError::VideoTooLong { .. }
            | ServiceError::DeliveryInterrupted(_) => Self::bad_request(message),
            ServiceError::EngineUnavailable(_) | ServiceError::Io(_) => Self::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}
