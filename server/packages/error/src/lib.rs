use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    TokenInvalid,
    PermissionDenied,
    SessionNotFound,
    NoActiveStream,
    SandboxUnavailable,
    ProvisioningFailed,
    DispatchFailed,
    StreamError,
    Timeout,
    Internal,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:session-relay:error:invalid_request",
            Self::TokenInvalid => "urn:session-relay:error:token_invalid",
            Self::PermissionDenied => "urn:session-relay:error:permission_denied",
            Self::SessionNotFound => "urn:session-relay:error:session_not_found",
            Self::NoActiveStream => "urn:session-relay:error:no_active_stream",
            Self::SandboxUnavailable => "urn:session-relay:error:sandbox_unavailable",
            Self::ProvisioningFailed => "urn:session-relay:error:provisioning_failed",
            Self::DispatchFailed => "urn:session-relay:error:dispatch_failed",
            Self::StreamError => "urn:session-relay:error:stream_error",
            Self::Timeout => "urn:session-relay:error:timeout",
            Self::Internal => "urn:session-relay:error:internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::TokenInvalid => "Token Invalid",
            Self::PermissionDenied => "Permission Denied",
            Self::SessionNotFound => "Session Not Found",
            Self::NoActiveStream => "No Active Stream",
            Self::SandboxUnavailable => "Sandbox Unavailable",
            Self::ProvisioningFailed => "Provisioning Failed",
            Self::DispatchFailed => "Dispatch Failed",
            Self::StreamError => "Stream Error",
            Self::Timeout => "Timeout",
            Self::Internal => "Internal Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::TokenInvalid => 401,
            Self::PermissionDenied => 403,
            Self::SessionNotFound => 404,
            Self::NoActiveStream => 404,
            Self::SandboxUnavailable => 503,
            Self::ProvisioningFailed => 500,
            Self::DispatchFailed => 502,
            Self::StreamError => 502,
            Self::Timeout => 504,
            Self::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("permission denied")]
    PermissionDenied { message: Option<String> },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("no active stream for execution {execution_id}")]
    NoActiveStream { execution_id: String },
    #[error("sandbox unavailable for session {session_id}: {reason}")]
    SandboxUnavailable { session_id: String, reason: String },
    #[error("provisioning failed at step {step}: {message}")]
    ProvisioningFailed { step: String, message: String },
    #[error("dispatch failed: {message}")]
    DispatchFailed { message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::PermissionDenied { .. } => ErrorType::PermissionDenied,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::NoActiveStream { .. } => ErrorType::NoActiveStream,
            Self::SandboxUnavailable { .. } => ErrorType::SandboxUnavailable,
            Self::ProvisioningFailed { .. } => ErrorType::ProvisioningFailed,
            Self::DispatchFailed { .. } => ErrorType::DispatchFailed,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Internal { .. } => ErrorType::Internal,
        }
    }

    fn extensions(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::SessionNotFound { session_id } => {
                map.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::SandboxUnavailable { session_id, reason } => {
                map.insert("sessionId".to_string(), Value::String(session_id.clone()));
                map.insert("reason".to_string(), Value::String(reason.clone()));
            }
            Self::NoActiveStream { execution_id } => {
                map.insert(
                    "executionId".to_string(),
                    Value::String(execution_id.clone()),
                );
            }
            Self::ProvisioningFailed { step, .. } => {
                map.insert("step".to_string(), Value::String(step.clone()));
            }
            Self::TokenInvalid { message }
            | Self::PermissionDenied { message }
            | Self::Timeout { message } => {
                if let Some(message) = message {
                    map.insert("message".to_string(), Value::String(message.clone()));
                }
            }
            Self::InvalidRequest { .. }
            | Self::DispatchFailed { .. }
            | Self::StreamError { .. }
            | Self::Internal { .. } => {}
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.extensions = self.extensions();
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}
