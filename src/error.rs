//! Error types for manager, worker, and protocol operations.
//!
//! This module defines the `SwarmError` enum covering all error conditions
//! that can occur while accepting workers, staging files, talking to the
//! catalog, and driving the task queue.
//!
//! It also provides helper methods to construct errors and generate
//! user-friendly messages.
use thiserror::Error;

/// Represents all possible errors in the taskswarm manager.
///
/// Each variant provides specific context to facilitate debugging and
/// user-friendly reporting.
///
/// # Exit Codes
///
/// Each error variant maps to an exit code via `SwarmError::exit_code`.
#[derive(Error, Debug)]
pub enum SwarmError {
    /// I/O operation failed during file system or socket access.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error due to invalid or missing settings.
    ///
    /// Contains a human-readable message describing the issue.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error
        message: String,
    },

    /// A worker violated the wire protocol.
    ///
    /// Carries the worker address and the offending detail. The worker
    /// is disconnected and its tasks are requeued.
    #[error("Protocol error [{addrport}]: {message}")]
    Protocol {
        /// Address and port of the offending worker
        addrport: String,
        /// Detailed description of the violation
        message: String,
    },

    /// A network operation did not complete before its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// TLS setup or handshake failure.
    #[error("TLS error: {message}")]
    Tls {
        /// Description of the TLS failure
        message: String,
    },

    /// Catalog server interaction failed.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// A task definition is malformed and cannot be dispatched.
    #[error("Invalid task: {message}")]
    InvalidTask {
        /// Why the task definition was rejected
        message: String,
    },

    /// The named file could not be found when staging inputs.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Generic manager-side operation failure with message.
    #[error("{0}")]
    Manager(String),

    /// Catch-all error variant wrapping any other failure.
    #[error("Unknown error: {0}")]
    Other(#[from] anyhow::Error),
}

// Convert reqwest error to catalog error
impl From<reqwest::Error> for SwarmError {
    fn from(err: reqwest::Error) -> Self {
        SwarmError::Catalog(err.to_string())
    }
}

// Convert config crate error to configuration error
impl From<config::ConfigError> for SwarmError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(path) => SwarmError::Config {
                message: format!("Configuration file not found: {}", path),
            },
            config::ConfigError::Message(msg) => SwarmError::Config { message: msg },
            _ => SwarmError::Config {
                message: format!("Configuration error: {}", err),
            },
        }
    }
}

impl From<serde_json::Error> for SwarmError {
    fn from(err: serde_json::Error) -> Self {
        SwarmError::Config {
            message: format!("JSON serialization/deserialization error: {}", err),
        }
    }
}

/// Specialized `Result` type for taskswarm operations.
pub type SwarmResult<T> = Result<T, SwarmError>;

impl SwarmError {
    /// Create a configuration error with the given message.
    pub fn config<S: Into<String>>(message: S) -> Self {
        SwarmError::Config {
            message: message.into(),
        }
    }

    /// Create a protocol error for the given worker address.
    pub fn protocol<S1, S2>(addrport: S1, message: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        SwarmError::Protocol {
            addrport: addrport.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error with the given description.
    pub fn timeout<S: Into<String>>(what: S) -> Self {
        SwarmError::Timeout(what.into())
    }

    /// Create a TLS error with the given message.
    pub fn tls<S: Into<String>>(message: S) -> Self {
        SwarmError::Tls {
            message: message.into(),
        }
    }

    /// Create an invalid-task error with the given message.
    pub fn invalid_task<S: Into<String>>(message: S) -> Self {
        SwarmError::InvalidTask {
            message: message.into(),
        }
    }

    /// Create a generic manager-side error with the given message.
    pub fn manager<S: Into<String>>(message: S) -> Self {
        SwarmError::Manager(message.into())
    }

    /// Return the corresponding exit code for this error variant.
    pub fn exit_code(&self) -> i32 {
        match self {
            SwarmError::Io(_) => 1,
            SwarmError::Config { .. } => 2,
            SwarmError::Catalog(_) => 3,
            SwarmError::Protocol { .. } => 4,
            SwarmError::Timeout(_) => 4,
            SwarmError::Tls { .. } => 5,
            SwarmError::InvalidTask { .. } => 6,
            _ => 1,
        }
    }

    /// Return a user-friendly error message with suggested remedies.
    pub fn user_friendly_message(&self) -> String {
        match self {
            SwarmError::Io(e) => format!("File or socket operation error: {}", e),
            SwarmError::Config { message } => format!(
                "Configuration error: {}\nHint: run 'taskswarm run --help' for details",
                message
            ),
            SwarmError::Protocol { addrport, message } => format!(
                "Protocol error from worker {}: {}\nHint: check that manager and worker versions match",
                addrport, message
            ),
            SwarmError::Timeout(what) => format!("Timed out: {}", what),
            SwarmError::Tls { message } => format!(
                "TLS error: {}\nHint: verify the key and certificate files",
                message
            ),
            SwarmError::Catalog(msg) => format!(
                "Catalog error: {}\nHint: check network connection and catalog host settings",
                msg
            ),
            SwarmError::InvalidTask { message } => format!("Invalid task: {}", message),
            SwarmError::FileNotFound(path) => format!("File not found: {}", path),
            SwarmError::Manager(msg) => msg.clone(),
            SwarmError::Other(err) => {
                format!("Unknown error: {}\nHint: please report this issue", err)
            }
        }
    }
}
