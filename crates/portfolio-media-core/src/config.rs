//! Configuration management for the media pipeline
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then environment variables of the form `PORTFOLIO_MEDIA__SECTION__KEY`
//! (for example `PORTFOLIO_MEDIA__WORKERS__COUNT=3`).

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "PORTFOLIO_MEDIA";

/// Main pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub optimization: OptimizationConfig,
    pub workers: WorkerConfig,
    pub folders: FolderConfig,
    pub logging: LoggingConfig,
}

/// Where media, the durable queue and the variant database live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub media_root: PathBuf,
    pub queue_dir: PathBuf,
    /// SQLite file for persisted variant paths; unset keeps results in memory
    pub database_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("portfolio-media");

        Self {
            media_root: base_dir.join("media"),
            queue_dir: base_dir.join("queue"),
            database_path: Some(base_dir.join("variants.db")),
        }
    }
}

/// Codec policy applied to every optimized asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationConfig {
    pub target_format: ImageFormat,
    pub quality_tier: QualityTier,
    pub size_tiers: Vec<SizeTier>,
    /// Above this pixel count a faster resampling filter is used
    pub very_large_pixels: u64,
    /// Upper bound on decoder allocations, in bytes
    pub max_decode_bytes: u64,
    pub variant_layout: VariantLayout,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            target_format: ImageFormat::WebP,
            quality_tier: QualityTier::Balanced,
            size_tiers: vec![
                SizeTier::new("small", 400, 400),
                SizeTier::new("medium", 800, 800),
                SizeTier::new("large", 1600, 1600),
            ],
            very_large_pixels: 20_000_000,
            max_decode_bytes: 1024 * 1024 * 1024, // 1GB
            variant_layout: VariantLayout::Suffixed,
        }
    }
}

/// Worker pool and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub count: usize,
    pub max_attempts: u32,
    pub task_timeout_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_secs: u64,
    pub backoff_multiplier: f64,
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: num_cpus::get().clamp(2, 4),
            max_attempts: 3,
            task_timeout_secs: 300, // 5 minutes
            backoff_initial_ms: 1000,
            backoff_max_secs: 300,
            backoff_multiplier: 2.0,
            poll_interval_ms: 500,
        }
    }
}

impl WorkerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Claims older than this are considered abandoned by their worker
    pub fn stale_claim_age(&self) -> Duration {
        self.task_timeout() * 2
    }
}

/// Folder lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfig {
    pub delete_attempts: u32,
    pub delete_backoff_ms: u64,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            delete_attempts: 5,
            delete_backoff_ms: 100,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Directory for daily-rotated log files; console only when unset
    pub output_path: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output_path: None,
            ansi: true,
        }
    }
}

/// Supported image formats
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    WebP,
    Gif,
    Bmp,
    Tiff,
    Avif,
    Heic,
}

impl ImageFormat {
    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::WebP => "webp",
            ImageFormat::Gif => "gif",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Tiff => "tiff",
            ImageFormat::Avif => "avif",
            ImageFormat::Heic => "heic",
        }
    }

    /// Parse a file extension (case-insensitive)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "webp" => Some(ImageFormat::WebP),
            "gif" => Some(ImageFormat::Gif),
            "bmp" => Some(ImageFormat::Bmp),
            "tiff" | "tif" => Some(ImageFormat::Tiff),
            "avif" => Some(ImageFormat::Avif),
            "heic" | "heif" => Some(ImageFormat::Heic),
            _ => None,
        }
    }

    /// Check if this format supports transparency
    pub fn supports_transparency(&self) -> bool {
        matches!(self, ImageFormat::Png | ImageFormat::WebP | ImageFormat::Gif)
    }

    /// Formats the codec can write variants in
    pub fn is_encodable(&self) -> bool {
        matches!(self, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP)
    }

    /// Formats with a lossless encoding mode
    pub fn supports_lossless(&self) -> bool {
        matches!(self, ImageFormat::Png | ImageFormat::WebP)
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Codec quality policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    /// Bit-for-bit visual fidelity; output size is not minimized
    Lossless,
    High,
    Balanced,
    Compressed,
}

impl QualityTier {
    /// Encoder quality (0-100) for lossy tiers
    pub fn quality(&self) -> Option<u8> {
        match self {
            QualityTier::Lossless => None,
            QualityTier::High => Some(95),
            QualityTier::Balanced => Some(85),
            QualityTier::Compressed => Some(75),
        }
    }

    pub fn is_lossless(&self) -> bool {
        matches!(self, QualityTier::Lossless)
    }
}

/// A named maximum-dimension bucket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SizeTier {
    pub name: String,
    pub max_width: u32,
    pub max_height: u32,
}

impl SizeTier {
    pub fn new(name: impl Into<String>, max_width: u32, max_height: u32) -> Self {
        Self {
            name: name.into(),
            max_width,
            max_height,
        }
    }
}

/// How variant files are named on disk
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum VariantLayout {
    /// `{role}/{basename}.{tier}.{ext}`
    Suffixed,
    /// `{role}/thumbnails/{basename}.{tier}.{ext}`
    ThumbnailDir,
}

impl PipelineConfig {
    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers.count == 0 {
            return Err(config_error("workers.count must be at least 1"));
        }
        if self.workers.max_attempts == 0 {
            return Err(config_error("workers.max_attempts must be at least 1"));
        }
        if self.workers.task_timeout_secs == 0 {
            return Err(config_error("workers.task_timeout_secs must be positive"));
        }
        if self.optimization.size_tiers.is_empty() {
            return Err(config_error("optimization.size_tiers must not be empty"));
        }
        if !self.optimization.target_format.is_encodable() {
            return Err(config_error(&format!(
                "optimization.target_format {} cannot be encoded",
                self.optimization.target_format
            )));
        }

        let mut names = HashSet::new();
        for tier in &self.optimization.size_tiers {
            if tier.max_width == 0 || tier.max_height == 0 {
                return Err(config_error(&format!(
                    "size tier '{}' has a zero dimension",
                    tier.name
                )));
            }
            if tier.name.is_empty()
                || !tier
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(config_error(&format!(
                    "size tier name '{}' must be a non-empty file-name-safe word",
                    tier.name
                )));
            }
            if !names.insert(tier.name.as_str()) {
                return Err(config_error(&format!(
                    "size tier '{}' is defined twice",
                    tier.name
                )));
            }
        }

        Ok(())
    }
}

fn config_error(message: &str) -> PipelineError {
    PipelineError::Config {
        message: message.to_string(),
    }
}

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
    config: PipelineConfig,
}

impl ConfigManager {
    /// Create a configuration manager with a custom path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = Self::load(Some(&config_path))?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Get the current configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Path the configuration is read from and saved to
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Update the configuration
    pub fn update_config(&mut self, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.save()
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::Config {
                message: format!("Failed to create config directory: {}", e),
            })?;
        }

        let config_str = toml::to_string_pretty(&self.config).map_err(|e| PipelineError::Config {
            message: format!("Failed to serialize config: {}", e),
        })?;

        std::fs::write(&self.config_path, config_str).map_err(|e| PipelineError::Config {
            message: format!("Failed to write config file: {}", e),
        })?;

        tracing::info!("Configuration saved to {:?}", self.config_path);
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| PipelineError::Config {
                message: "Could not determine config directory".to_string(),
            })?
            .join("portfolio-media");

        Ok(config_dir.join("config.toml"))
    }

    /// Layer defaults, the optional file and environment overrides
    pub fn load(path: Option<&Path>) -> Result<PipelineConfig> {
        let defaults = config::Config::try_from(&PipelineConfig::default()).map_err(|e| {
            PipelineError::Config {
                message: format!("Failed to build default config: {}", e),
            }
        })?;

        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            if path.exists() {
                tracing::info!("Configuration loaded from {:?}", path);
            }
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: PipelineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| PipelineError::Config {
                message: format!("Failed to parse configuration: {}", e),
            })?;

        config.validate()?;
        Ok(config)
    }
}
