//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the IR module
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The serial port failed or could not be configured
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// No transport is bound to the session
    #[error("Not connected to IR module")]
    NotConnected,

    /// The named port does not exist
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// The OS refused access to the port
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The session's dispatch loop is no longer running
    #[error("Device session dispatch loop has stopped")]
    SessionClosed,

    /// A session was created outside of a Tokio runtime
    #[error("No Tokio runtime available to run the dispatch loop")]
    NoRuntime,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serialport::Error> for ProtocolError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(e.to_string()),
            serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                ProtocolError::PortNotFound(e.to_string())
            }
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                ProtocolError::PermissionDenied(e.to_string())
            }
            _ => ProtocolError::SerialError(e.to_string()),
        }
    }
}
