use crate::server::cors::{self, Expose};
use crate::upstream::{CollectError, TransportError};
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced to HTTP clients.
///
/// Client-facing bodies are short and generic for server-side failures; the
/// full detail only goes to the log.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing, empty or unusable `url` parameter.
    #[error("Invalid URL: {0}")]
    InvalidInput(String),

    /// Every attempt failed below the HTTP layer.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[source] TransportError),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("upstream playlist exceeds {limit} bytes")]
    PlaylistTooLarge { limit: usize },

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl From<TransportError> for RelayError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => Self::UpstreamTimeout,
            other => Self::UpstreamUnavailable(other),
        }
    }
}

impl From<CollectError> for RelayError {
    fn from(e: CollectError) -> Self {
        match e {
            CollectError::Transport(inner) => inner.into(),
            CollectError::TooLarge { limit } => Self::PlaylistTooLarge { limit },
        }
    }
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamUnavailable(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::PlaylistTooLarge { .. } => StatusCode::BAD_GATEWAY,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn public_message(&self) -> String {
        match self {
            Self::InvalidInput(_) => self.to_string(),
            Self::RateLimited => "Rate limit exceeded".to_string(),
            Self::UpstreamTimeout => "Gateway Timeout".to_string(),
            Self::PlaylistTooLarge { .. } => "Bad Gateway".to_string(),
            Self::UpstreamUnavailable(_) | Self::InternalError(_) => {
                "Internal Server Error".to_string()
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed ({}): {}", status, self);
        } else {
            warn!("Request rejected ({}): {}", status, self);
        }

        let mut headers = HeaderMap::new();
        cors::apply(&mut headers, Expose::Nothing);

        (status, headers, format!("{}\n", self.public_message())).into_response()
    }
}
