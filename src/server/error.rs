use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::manifest::MpdError;

pub type AppResult<T> = Result<T, Error>;

/// everything a request can fail with, none of these touch registry state so they all end at the
/// request boundary
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),

    #[error("unknown channel '{0}'")]
    ChannelNotFound(String),

    #[error("unknown representation '{0}'")]
    RepresentationNotFound(String),

    #[error("segment not found")]
    SegmentNotFound,

    #[error("segment expired")]
    SegmentExpired,

    #[error("too many requests, retry in {retry_after}s")]
    TooManyRequests { retry_after: u64 },

    #[error("upstream fetch failed: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream returned {0}")]
    UpstreamStatus(StatusCode),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("{0}")]
    InternalServerErrorWithContext(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ChannelNotFound(_) | Self::RepresentationNotFound(_) | Self::SegmentNotFound => {
                StatusCode::NOT_FOUND
            }
            Self::SegmentExpired => StatusCode::GONE,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable(_) | Self::UpstreamStatus(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::InternalServerErrorWithContext(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            error!(status = %status, error = %self, "request failed");
        }

        let body = Json(json!({ "error": self.to_string() }));

        match self {
            Self::TooManyRequests { retry_after } => {
                (status, [(header::RETRY_AFTER, retry_after.to_string())], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}

impl From<MpdError> for Error {
    fn from(err: MpdError) -> Self {
        match err {
            MpdError::RepresentationNotFound(id) => Self::RepresentationNotFound(id),
            // anything else means upstream handed us an MPD we can't use
            other => Self::UpstreamUnavailable(other.to_string()),
        }
    }
}
