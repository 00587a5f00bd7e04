//! Routing error taxonomy and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes reported to clients in the `X-Proxy-Error` header and JSON body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No application is registered for the hostname
    UnknownHost,
    /// Inbound connection security does not match the hostname's TLS policy
    PolicyMismatch,
    /// The managed port range is exhausted
    NoCapacity,
    /// The backend process could not be started
    SpawnFailed,
    /// The backend never started listening
    ReadinessTimeout,
    /// The registry store could not be reached
    StoreUnavailable,
    /// Forwarding to an already chosen backend failed
    TransportFailure,
    /// A provisioning peer answered with an unusable body
    InvalidProvisionResponse,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost | ProxyErrorCode::PolicyMismatch => StatusCode::NOT_FOUND,
            ProxyErrorCode::NoCapacity
            | ProxyErrorCode::SpawnFailed
            | ProxyErrorCode::ReadinessTimeout
            | ProxyErrorCode::StoreUnavailable
            | ProxyErrorCode::TransportFailure
            | ProxyErrorCode::InvalidProvisionResponse => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::PolicyMismatch => "POLICY_MISMATCH",
            ProxyErrorCode::NoCapacity => "NO_CAPACITY",
            ProxyErrorCode::SpawnFailed => "SPAWN_FAILED",
            ProxyErrorCode::ReadinessTimeout => "READINESS_TIMEOUT",
            ProxyErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ProxyErrorCode::TransportFailure => "TRANSPORT_FAILURE",
            ProxyErrorCode::InvalidProvisionResponse => "INVALID_PROVISION_RESPONSE",
        }
    }
}

/// Failure of a registry round-trip
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("malformed registry record: {0}")]
    Record(#[from] serde_json::Error),
    #[error("unsupported registry url: {0}")]
    UnsupportedUrl(String),
    #[error("application {0} is not registered")]
    UnknownApplication(String),
    #[error("registry task failed: {0}")]
    Task(String),
}

/// Why a request could not be routed to a backend
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("missing or invalid Host header")]
    MissingHost,
    #[error("web application not found in registry: {0}")]
    NotFound(String),
    #[error("request security does not match security configuration of {0}")]
    PolicyMismatch(String),
    #[error("no ports remain available to initiate application {0}")]
    NoCapacity(String),
    #[error("unable to start process {0}")]
    SpawnFailed(String),
    #[error("the application process did not establish a listener in a timely manner")]
    Timeout,
    #[error("registry unavailable: {0}")]
    StoreUnavailable(#[from] RegistryError),
    #[error("an error occurred when routing to {0}")]
    TransportFailure(String),
    #[error("invalid provisioning response: {0}")]
    InvalidResponse(String),
}

impl RouteError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            RouteError::MissingHost => ProxyErrorCode::MissingHostHeader,
            RouteError::NotFound(_) => ProxyErrorCode::UnknownHost,
            RouteError::PolicyMismatch(_) => ProxyErrorCode::PolicyMismatch,
            RouteError::NoCapacity(_) => ProxyErrorCode::NoCapacity,
            RouteError::SpawnFailed(_) => ProxyErrorCode::SpawnFailed,
            RouteError::Timeout => ProxyErrorCode::ReadinessTimeout,
            RouteError::StoreUnavailable(_) => ProxyErrorCode::StoreUnavailable,
            RouteError::TransportFailure(_) => ProxyErrorCode::TransportFailure,
            RouteError::InvalidResponse(_) => ProxyErrorCode::InvalidProvisionResponse,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code().status_code()
    }

    /// Render this error as the client-visible JSON response
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.to_string())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

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
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
