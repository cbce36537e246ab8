use std::fmt;

use super::session::SessionState;

/// Error type for control port operations
#[derive(Debug)]
pub enum ControlError {
    /// The daemon refused the connection
    ConnectionRefused(std::io::Error),
    /// The control endpoint could not be reached
    Unreachable(std::io::Error),
    /// Authentication was rejected or impossible
    AuthFailed(String),
    /// The daemon replied outside of the documented protocol
    ProtocolViolation(String),
    /// The daemon rejected a command with an error status
    Rejected { status: u16, message: String },
    /// An operation was attempted in the wrong session state
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    /// The daemon closed the connection mid-exchange
    Closed,
    /// Reading from or writing to the connection failed
    Io(std::io::Error),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::ConnectionRefused(e) => write!(f, "connection refused: {}", e),
            ControlError::Unreachable(e) => write!(f, "control port unreachable: {}", e),
            ControlError::AuthFailed(reason) => write!(f, "authentication failed: {}", reason),
            ControlError::ProtocolViolation(reason) => write!(f, "protocol violation: {}", reason),
            ControlError::Rejected { status, message } => {
                write!(f, "command rejected ({}): {}", status, message)
            }
            ControlError::InvalidState { operation, state } => {
                write!(f, "cannot {} while session is {}", operation, state)
            }
            ControlError::Closed => write!(f, "control connection closed by the daemon"),
            ControlError::Io(e) => write!(f, "control connection I/O failed: {}", e),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::ConnectionRefused(e)
            | ControlError::Unreachable(e)
            | ControlError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ControlError {
    fn from(e: std::io::Error) -> Self {
        ControlError::Io(e)
    }
}
