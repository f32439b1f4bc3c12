//! Error types for the EC restore engine and the extended-action registry

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while admitting, running, or restoring
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Registry / Lifecycle Errors
    // =========================================================================
    /// No factory registered for the requested kind
    #[error("No factory registered for task kind: {0}")]
    UnknownTaskKind(String),

    /// Task id is not (or no longer) known to the registry
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Task exists but is not of the expected kind
    #[error("Task {task} is not a {expected} task")]
    TaskMismatch { task: String, expected: String },

    /// Task was aborted
    #[error("{task} aborted: {cause}")]
    Aborted { task: String, cause: String },

    // =========================================================================
    // Admission Errors
    // =========================================================================
    /// EC requests are currently disabled on the engine
    #[error("EC requests are disabled")]
    EcRequestsDisabled,

    /// Object is not known to the cluster map
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Object maps to a mount the engine has no worker for
    #[error("{task}: invalid or lost mountpath {mount:?}")]
    UnknownMount { task: String, mount: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Response arrived for a name with no registered writer
    #[error("no slice writer for {uname}")]
    NoWriter { uname: String },

    /// Response stream ended before the declared size
    #[error("failed to read {uname} replica: short read ({received} of {expected} bytes)")]
    ShortRead {
        uname: String,
        expected: u64,
        received: u64,
    },

    /// Unknown opcode in a peer response header
    #[error("invalid EC message opcode: {0}")]
    InvalidOpcode(u8),

    /// Outbound fetch could not be issued
    #[error("Transport error: {0}")]
    Transport(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Caller-side wait expired; the server side keeps working
    #[error("Timed out after {duration:?} waiting for {what}")]
    Timeout {
        what: String,
        duration: std::time::Duration,
    },
}

impl Error {
    /// True for errors that mean the data source will not succeed on retry
    pub fn is_fatal_transfer(&self) -> bool {
        match self {
            Error::ShortRead { .. } => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_read_is_fatal() {
        let err = Error::ShortRead {
            uname: "t1/ais/b/o".to_string(),
            expected: 10,
            received: 4,
        };
        assert!(err.is_fatal_transfer());
        assert!(err.to_string().contains("4 of 10"));
    }

    #[test]
    fn test_unexpected_eof_is_fatal() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(err.is_fatal_transfer());

        let err = Error::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(!err.is_fatal_transfer());
    }

    #[test]
    fn test_no_writer_is_not_fatal() {
        let err = Error::NoWriter {
            uname: "t1/ais/b/o".to_string(),
        };
        assert!(!err.is_fatal_transfer());
    }
}
