//! Error types for the copy pipeline.

use thiserror::Error;

/// Main error type for copy operations.
#[derive(Error, Debug)]
pub enum CopyError {
    /// Configuration error (invalid block size, in-flight window, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Setup failed before any request was admitted (open/allocate).
    #[error("Setup failed: {message}\n  Context: {context}")]
    Setup { message: String, context: String },

    /// The submission queue depth was exceeded. Should not happen while the
    /// admission controller respects the in-flight window.
    #[error("Submission queue saturated: {queued} requests queued (depth {depth})")]
    ContextSaturated { queued: usize, depth: usize },

    /// Descriptor-level failure while submitting a request.
    #[error("Failed to submit {kind} request at offset {offset}: {message}")]
    Submission {
        kind: &'static str,
        offset: u64,
        message: String,
    },

    /// A write completed with fewer bytes than requested. Always fatal,
    /// unlike read underflow which is tolerated.
    #[error("Write mismatch at offset {offset}: wrote {completed} of {requested} bytes")]
    WriteMismatch {
        offset: u64,
        requested: usize,
        completed: usize,
    },

    /// Unrecoverable descriptor error reported by a completion.
    #[error("Fatal {kind} error at offset {offset}: {source}")]
    FatalIo {
        kind: &'static str,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    /// Transfer was cancelled (SIGINT, etc.) before all bytes moved.
    #[error("Transfer cancelled")]
    Cancelled,

    /// The source went idle and the transfer finished short of the requested
    /// length. Raised by callers that treat a degraded run as failure.
    #[error("Transfer incomplete: {transferred} of {total} bytes")]
    Incomplete { transferred: u64, total: u64 },

    /// IO error (file operations outside the pipeline).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (report output).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Process exit codes expected by callers of the CLI tools.
pub const EXIT_CONFIG_ERROR: u8 = 1;
pub const EXIT_SETUP_ERROR: u8 = 2;
pub const EXIT_IO_ERROR: u8 = 3;
pub const EXIT_CANCELLED: u8 = 4;

impl CopyError {
    /// Create a Setup error with context about where it occurred.
    pub fn setup(message: impl Into<String>, context: impl Into<String>) -> Self {
        CopyError::Setup {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Submission error.
    pub fn submission(kind: &'static str, offset: u64, message: impl Into<String>) -> Self {
        CopyError::Submission {
            kind,
            offset,
            message: message.into(),
        }
    }

    /// Map the error to the process exit code contract: setup failures,
    /// in-flight fatal I/O and user cancellation are distinguishable.
    pub fn exit_code(&self) -> u8 {
        match self {
            CopyError::Config(_) | CopyError::Json(_) => EXIT_CONFIG_ERROR,
            CopyError::Setup { .. } | CopyError::Io(_) => EXIT_SETUP_ERROR,
            CopyError::ContextSaturated { .. }
            | CopyError::Submission { .. }
            | CopyError::WriteMismatch { .. }
            | CopyError::FatalIo { .. }
            | CopyError::Incomplete { .. } => EXIT_IO_ERROR,
            CopyError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including the error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for copy operations.
pub type Result<T> = std::result::Result<T, CopyError>;
