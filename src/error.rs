use axum::{
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use thiserror::Error;

use crate::models::{GoogleErrorBody, GoogleErrorResponse};
use crate::route::RouteError;
use crate::translate::TranslateError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Routing(#[from] RouteError),

    #[error("Permission denied. Invalid API key.")]
    Auth,

    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("failed to convert request for target: {0}")]
    RequestDecode(#[source] TranslateError),

    #[error("failed to convert response from target: {0}")]
    ResponseDecode(#[source] TranslateError),

    #[error("failed to read response from target: {0}")]
    ResponseRead(String),

    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("too many in-flight requests")]
    Overloaded,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Routing(_) => StatusCode::NOT_FOUND,
            GatewayError::Auth => StatusCode::FORBIDDEN,
            GatewayError::BodyRead(_) => StatusCode::BAD_REQUEST,
            GatewayError::RequestDecode(_)
            | GatewayError::ResponseDecode(_)
            | GatewayError::ResponseRead(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Overloaded => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Routing(_) => "routing",
            GatewayError::Auth => "auth",
            GatewayError::BodyRead(_) => "body_read",
            GatewayError::RequestDecode(_) | GatewayError::ResponseDecode(_) => "decode",
            GatewayError::ResponseRead(_) | GatewayError::Transport(_) => "transport",
            GatewayError::Overloaded => "overloaded",
        }
    }
}

pub fn google_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        502 | 503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "INTERNAL",
    }
}

pub fn error_body(status: StatusCode, message: impl Into<String>) -> GoogleErrorResponse {
    GoogleErrorResponse {
        error: GoogleErrorBody {
            code: status.as_u16(),
            message: message.into(),
            status: google_status(status).to_string(),
        },
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        (status, Json(error_body(status, self.to_string()))).into_response()
    }
}
