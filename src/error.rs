//! Error taxonomy for the resolution service
//!
//! Every failure surfaced by the library is a [`VendorError`]. Errors raised during
//! submission are returned synchronously to the caller; errors raised inside the
//! pipeline end up in the request's `state_reason` via [`VendorError::user_message`].

use thiserror::Error;

/// Errors raised by an external command (VCS client, package-manager CLI)
#[derive(Debug, Error)]
pub enum ToolError {
    /// The executable could not be started
    #[error("Failed to start {program}: {message}")]
    Spawn { program: String, message: String },

    /// The command ran but exited unsuccessfully
    #[error("{program} exited with status {status}")]
    Failed {
        program: String,
        status: i32,
        stderr: String,
    },

    /// The command did not finish within its deadline
    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },
}

#[derive(Debug, Error)]
pub enum VendorError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    NotFound(String),

    /// Network, authentication or missing-revision failures while fetching
    #[error("{0}")]
    Fetch(String),

    #[error("{0}")]
    InvalidRepoStructure(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Integrity(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("The request was cancelled")]
    Cancelled,

    #[error("{step} timed out after {seconds}s")]
    Timeout { step: String, seconds: u64 },

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = VendorError> = std::result::Result<T, E>;

impl VendorError {
    /// HTTP status the request surface reports for this error
    pub fn status_code(&self) -> u16 {
        match self {
            VendorError::InvalidInput(_)
            | VendorError::InvalidState(_)
            | VendorError::Validation(_) => 400,
            VendorError::Authorization(_) => 403,
            VendorError::NotFound(_) => 404,
            _ => 500,
        }
    }

    /// Only transient network failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, VendorError::Fetch(_) | VendorError::Timeout { .. })
    }

    /// Text that is safe to record in `state_reason`
    ///
    /// Tool output and I/O details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            VendorError::Tool(ToolError::Timeout { program, seconds }) => {
                format!("Running {} timed out after {}s", program, seconds)
            }
            VendorError::Tool(ToolError::Failed { program, .. })
            | VendorError::Tool(ToolError::Spawn { program, .. }) => {
                format!("Running {} failed", program)
            }
            VendorError::Io(_) | VendorError::Internal(_) => {
                "An unexpected error occurred while processing the request".to_string()
            }
            VendorError::Cancelled => "Cancelled by an administrator".to_string(),
            other => other.to_string(),
        }
    }

    pub fn io(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        VendorError::Io(format!("{}: {}", context, err))
    }
}

impl From<std::io::Error> for VendorError {
    fn from(err: std::io::Error) -> Self {
        VendorError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for VendorError {
    fn from(err: anyhow::Error) -> Self {
        VendorError::Io(format!("{:#}", err))
    }
}
