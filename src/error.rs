//! Error types for the gateway.

use crate::models::ModelFamily;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// A provider payload could not be decoded. Never retried.
    #[error("Failed to decode {family} payload at {path}: {message}")]
    Decode {
        family: ModelFamily,
        path: String,
        message: String,
    },

    /// The upstream answered with a non-2xx status. The body is relayed as-is.
    #[error("Upstream returned status {status}")]
    Upstream { status: u16, body: String },

    #[error("Upstream call timed out after {after_secs}s")]
    Timeout { after_secs: f64 },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl GatewayError {
    pub fn decode(family: ModelFamily, path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Decode {
            family,
            path: path.into(),
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    /// Map a reqwest failure, telling deadline expiry apart from connection trouble.
    pub fn from_reqwest(err: reqwest::Error, timeout_secs: f64) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                after_secs: timeout_secs,
            }
        } else {
            Self::transport(err.to_string())
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Decode { .. } | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport { .. } => StatusCode::BAD_GATEWAY,
            Self::Config { .. } | Self::Io(_) | Self::Toml(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::Decode { .. } | Self::Json(_) => "invalid_request_error",
            Self::Timeout { .. } => "timeout_error",
            Self::Upstream { .. } | Self::Transport { .. } => "upstream_error",
            _ => "api_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let Self::Upstream { body, .. } = self {
            return (status, body).into_response();
        }

        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
