//! Logging configuration and initialization

use crate::config::LoggingConfig;
use crate::error::{PipelineError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// File name prefix for rotated log files
const LOG_FILE_PREFIX: &str = "portfolio-media.log";

/// Initialize the logging system
///
/// `RUST_LOG` wins over the configured level. When `output_path` is set a
/// daily-rotated file layer is added; keep the returned guard alive for the
/// lifetime of the process or buffered lines are lost.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| PipelineError::Logging {
            message: format!("Invalid log level '{}': {}", config.level, e),
        })?;

    let console = fmt::layer().with_ansi(config.ansi).with_target(true);

    let (file_layer, guard) = match &config.output_path {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| PipelineError::Logging {
                message: format!("Failed to create log directory {}: {}", dir.display(), e),
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()
    {
        Ok(()) => Ok(guard),
        Err(e) => {
            let error_msg = e.to_string();
            if error_msg.contains("a global default trace dispatcher has already been set") {
                // Already initialized by the embedding application
                Ok(guard)
            } else {
                Err(PipelineError::Logging {
                    message: format!("Failed to initialize logging: {}", e),
                })
            }
        }
    }
}
