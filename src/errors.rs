//! Gateway error type.
//!
//! `ApiError` keeps two messages apart: a public one that is fixed per
//! error kind and rendered to clients, and an internal cause chain that is
//! only ever logged. `extend` adds context to the cause, never to the
//! public message.

use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::fmt;

pub const INTERNAL_ERROR_MESSAGE: &str = "an internal server error occurred";

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub cause: anyhow::Error,
    pub data: Option<Map<String, Value>>,
}

/// Public part of an error, as rendered in response envelopes.
#[derive(Debug, Serialize, PartialEq)]
pub struct ErrorBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Create an error whose internal cause starts out as the public message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        let message = msg.into();
        Self {
            status,
            cause: anyhow::anyhow!(message.clone()),
            message,
            data: None,
        }
    }

    /// 500 with the generic public message; `cause` is kept for logs only.
    pub fn internal(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: INTERNAL_ERROR_MESSAGE.to_string(),
            cause: cause.into(),
            data: None,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Attach a structured value to the public payload.
    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }

    /// Prepend context to the internal cause. The public message is untouched.
    pub fn extend<C>(mut self, context: C) -> Self
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        self.cause = self.cause.context(context);
        self
    }

    /// Full internal cause chain, outermost context first.
    pub fn internal_message(&self) -> String {
        format!("{:#}", self.cause)
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            message: self.message.clone(),
            data: self.data.clone(),
        }
    }

    /// Log at a level matching the status class.
    pub fn log(&self) {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), "{}", self.internal_message());
        } else {
            tracing::debug!(status = self.status.as_u16(), "{}", self.internal_message());
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.message, self.cause)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.log();
        let body = Json(json!({ "error": self.body() }));
        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal(err)
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::new(err.status(), "invalid multipart request").extend(err.body_text())
    }
}
