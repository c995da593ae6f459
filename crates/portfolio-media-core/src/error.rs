//! Error types for the media optimization pipeline

use std::path::PathBuf;

/// Main error type for pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image format not supported: {format}")]
    UnsupportedFormat { format: String },

    #[error("Failed to decode {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("Failed to encode {format} variant: {message}")]
    Encode { format: String, message: String },

    #[error("Transient IO failure on {path}: {message}")]
    TransientIo { path: PathBuf, message: String },

    #[error("Insufficient memory for operation: {message}")]
    OutOfMemory { message: String },

    #[error("Timeout occurred after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Folder conflict at {path}: {message}")]
    FolderConflict { path: PathBuf, message: String },

    #[error("Could not fully delete {path}: {remaining} entries remain ({message})")]
    FolderDeleteIncomplete {
        path: PathBuf,
        remaining: usize,
        message: String,
    },

    #[error("Task queue storage unavailable: {message}")]
    QueueUnavailable { message: String },

    #[error("Task queue is closed to new work")]
    QueueClosed,

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: uuid::Uuid },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Logging initialization failed: {message}")]
    Logging { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Get the error type as a string for categorization
    pub fn error_type(&self) -> &'static str {
        match self {
            PipelineError::Io(_) => "io_error",
            PipelineError::UnsupportedFormat { .. } => "unsupported_format",
            PipelineError::Decode { .. } => "decode_error",
            PipelineError::Encode { .. } => "encode_error",
            PipelineError::TransientIo { .. } => "transient_io",
            PipelineError::OutOfMemory { .. } => "out_of_memory",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::FolderConflict { .. } => "folder_conflict",
            PipelineError::FolderDeleteIncomplete { .. } => "folder_delete_incomplete",
            PipelineError::QueueUnavailable { .. } => "queue_unavailable",
            PipelineError::QueueClosed => "queue_closed",
            PipelineError::TaskNotFound { .. } => "task_not_found",
            PipelineError::Config { .. } => "config_error",
            PipelineError::Logging { .. } => "logging_error",
            PipelineError::InvalidInput { .. } => "invalid_input",
            PipelineError::Database(_) => "database_error",
            PipelineError::Serialization(_) => "serialization_error",
        }
    }

    /// Check if another attempt at the same task may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Io(_)
                | PipelineError::TransientIo { .. }
                | PipelineError::OutOfMemory { .. }
                | PipelineError::Timeout { .. }
                | PipelineError::FolderConflict { .. }
                | PipelineError::FolderDeleteIncomplete { .. }
                | PipelineError::Database(_)
        )
    }

    /// Errors that condemn a single asset but not the rest of its task
    pub fn is_asset_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::UnsupportedFormat { .. }
                | PipelineError::Decode { .. }
                | PipelineError::Encode { .. }
        )
    }

    pub(crate) fn queue_io(context: &str, err: std::io::Error) -> Self {
        PipelineError::QueueUnavailable {
            message: format!("{}: {}", context, err),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, PipelineError>;
