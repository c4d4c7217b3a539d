use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal errors that abort startup before the gateway begins serving.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("failed to load backend registry: {0}")]
    RegistryLoad(#[source] anyhow::Error),

    #[error("failed to bind SOCKS5 ingress listener on {addr}: {source}")]
    IngressBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind control API listener on {addr}: {source}")]
    ControlApiBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Error response structure returned by the control API.
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    /// Human-readable error description
    pub message: String,
}

/// Errors surfaced directly to control-API callers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("pool is empty")]
    PoolEmpty,

    #[error("backend port {0} is not in use")]
    NotInUse(u16),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::PoolEmpty => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotInUse(_) => StatusCode::BAD_REQUEST,
        };

        let body = Json(ErrorResponse {
            message: self.to_string(),
        });

        (status, body).into_response()
    }
}
