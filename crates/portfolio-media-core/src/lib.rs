//! # Portfolio Media Core
//!
//! Background image optimization for portfolio projects and services:
//! a durable task queue, a worker pool that produces resized WebP/PNG/JPEG
//! variants, and lifecycle management of each entity's media folder.

pub mod codec;
pub mod config;
pub mod error;
pub mod folders;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod sink;
pub mod status;
pub mod utils;
pub mod worker;

// Re-export commonly used types
pub use codec::{EncodedVariant, ImageCodec, VariantSet};
pub use config::*;
pub use error::*;
pub use folders::{EntityGuard, FolderHandle, FolderManager, PreparedFolder, WrittenVariants};
pub use logging::*;
pub use models::*;
pub use pipeline::MediaPipeline;
pub use queue::{QueueEvent, QueueStats, RetryPolicy, TaskQueue};
pub use sink::{MemoryResultSink, ResultSink, SqliteResultSink};
pub use status::{DisplayState, StatusReporter, StatusSnapshot, WorkerState};
pub use worker::WorkerPool;

/// Initialize logging for the core library
///
/// Returns the file writer guard when file logging is configured.
pub fn init(
    config: &LoggingConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let guard = logging::init_logging(config)?;
    tracing::info!(version = version(), "Portfolio media core initialized");
    Ok(guard)
}

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
