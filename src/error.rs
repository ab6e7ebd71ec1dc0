//! Error handling and JSON error responses for the gateway

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Unknown or unconfigured server name
    UnknownServer,
    /// Server is configured but its connection is not ready
    ServerNotReady,
    /// Unknown session id
    SessionNotFound,
    /// The backend's channel closed while forwarding
    BackendUnreachable,
    /// Request body was not valid JSON
    InvalidBody,
    /// HTTP method not supported on this route
    MethodNotAllowed,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::UnknownServer => StatusCode::NOT_FOUND,
            GatewayErrorCode::ServerNotReady => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::SessionNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::BackendUnreachable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::InvalidBody => StatusCode::BAD_REQUEST,
            GatewayErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::UnknownServer => "UNKNOWN_SERVER",
            GatewayErrorCode::ServerNotReady => "SERVER_NOT_READY",
            GatewayErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            GatewayErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            GatewayErrorCode::InvalidBody => "INVALID_BODY",
            GatewayErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
