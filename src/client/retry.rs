//! Remote-dispatch error classification.
//!
//! A retry is only ever spent on transient transport trouble; anything
//! that reflects the request itself (bad arguments, auth, unimplemented
//! surface) fails on the first attempt.

use tonic::Code;

/// What one remote attempt produced, when it did not produce a
/// response.
#[derive(Debug)]
pub enum AttemptError {
    /// Dial/connection-level failure; always transient.
    Transport(String),
    /// The RPC itself failed with a status.
    Rpc(tonic::Status),
}

impl AttemptError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rpc(status) => is_retryable_code(status.code()),
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(message) => write!(f, "transport: {message}"),
            Self::Rpc(status) => write!(f, "rpc: {status}"),
        }
    }
}

/// Status codes worth another attempt.
pub fn is_retryable_code(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable
            | Code::ResourceExhausted
            | Code::Aborted
            | Code::Internal
            | Code::DataLoss
            | Code::DeadlineExceeded
            | Code::Unknown
    )
}
