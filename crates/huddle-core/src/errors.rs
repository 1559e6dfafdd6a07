use thiserror::Error;

#[derive(Debug, Error)]
pub enum HuddleError {
    #[error("participant already registered: {0}")]
    DuplicateParticipant(String),
    #[error("unknown participant: {0}")]
    UnknownParticipant(String),
    #[error("capture device error: {0}")]
    CaptureDevice(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("session disconnected: {0}")]
    Disconnected(String),
    #[error("a session is already running on this client")]
    AlreadyJoined,
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl HuddleError {
    /// Registry invariant violations, as opposed to runtime failures.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            HuddleError::DuplicateParticipant(_) | HuddleError::UnknownParticipant(_)
        )
    }
}

/// Failures reported by a session provider implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("capture: {0}")]
    Capture(String),
    #[error("publish: {0}")]
    Publish(String),
    #[error("unpublish: {0}")]
    Unpublish(String),
    #[error("not supported: {0}")]
    Unsupported(&'static str),
    #[error("{0}")]
    Other(String),
}
