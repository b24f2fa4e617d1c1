use std::fmt;

use thiserror::Error;

use crate::control::SandboxCallError;
use crate::session::StoreError;

/// Provisioning stage a creation failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    Env,
    Config,
    Workspace,
    Ready,
    Relay,
}

impl ProvisionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Env => "env",
            Self::Config => "config",
            Self::Workspace => "workspace",
            Self::Ready => "ready",
            Self::Relay => "relay",
        }
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("sandbox for session {session_id} is unavailable: {reason}")]
    SandboxUnavailable { session_id: String, reason: String },
    #[error("{step}: {message}")]
    Provisioning { step: ProvisionStep, message: String },
    #[error(transparent)]
    Sandbox(#[from] SandboxCallError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    pub(crate) fn provisioning(step: ProvisionStep, err: impl fmt::Display) -> Self {
        Self::Provisioning {
            step,
            message: err.to_string(),
        }
    }
}
