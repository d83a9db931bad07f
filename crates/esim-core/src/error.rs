use thiserror::Error;

/// Failure returned by a plugin method, carrying a stable code for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MethodError {
    #[error("Activation code is empty")]
    EmptyCode,
    #[error("EuiccManager is null")]
    EuiccUnavailable,
    #[error("an eSIM installation is already in progress")]
    InstallInProgress,
    #[error("{0}")]
    InvalidArgument(String),
    #[error("method not implemented: {0}")]
    NotImplemented(String),
    #[error("{0}")]
    Exception(String),
}

impl MethodError {
    pub fn code(&self) -> &'static str {
        match self {
            MethodError::EmptyCode => "EMPTY_CODE",
            MethodError::EuiccUnavailable => "EUICC_NULL",
            MethodError::InstallInProgress => "INSTALL_IN_PROGRESS",
            MethodError::InvalidArgument(_) => "INVALID_ARGUMENT",
            MethodError::NotImplemented(_) => "NOT_IMPLEMENTED",
            MethodError::Exception(_) => "EXCEPTION",
        }
    }
}

/// Failure reported by an [`EsimPlatform`](crate::platform::EsimPlatform)
/// collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("no foreground activity to launch from")]
    NoActivity,
    #[error("target not resolvable: {0}")]
    Unresolvable(String),
    #[error("platform call failed: {0}")]
    Call(String),
}

/// Answer given to the OS when the handoff slot has nothing to offer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} (code {code})")]
pub struct CodeUnavailable {
    pub code: i32,
    pub reason: &'static str,
}
