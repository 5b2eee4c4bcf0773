use thiserror::Error;

/// Error taxonomy for the security core.
///
/// Policy and guard decisions are values, never errors; this type covers the
/// session and MFA paths, where callers must distinguish hard failures
/// (storage unreachable) from soft ones (bad credential).
#[derive(Error, Debug)]
pub enum CoreError {
    /// Transient dependency failure. Read-modify-write paths treat this as
    /// fail-closed: the request is denied, not retried.
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Invalid credential")]
    InvalidCredential,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session expired")]
    SessionExpired,

    #[error("Session is not active")]
    SessionInactive,

    #[error("Session terminated: {0}")]
    SessionTerminated(String),

    #[error("Challenge not found")]
    ChallengeNotFound,

    #[error("Challenge expired")]
    ChallengeExpired,

    #[error("Maximum verification attempts exceeded")]
    AttemptsExhausted,

    #[error("User not found")]
    UserNotFound,

    #[error("MFA is not enrolled for this user")]
    MfaNotEnrolled,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl CoreError {
    /// Whether the failure is worth retrying from the caller's side.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Storage(_))
    }

    /// Whether the error should surface as a generic authentication failure
    /// instead of its specific cause (enumeration-leak avoidance).
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidCredential
                | CoreError::SessionNotFound
                | CoreError::ChallengeNotFound
                | CoreError::UserNotFound
        )
    }
}
