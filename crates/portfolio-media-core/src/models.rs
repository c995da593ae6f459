//! Core data models shared by the queue, folder manager and workers

use crate::config::ImageFormat;
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for optimization tasks
pub type TaskId = Uuid;

/// Kind of entity that owns images
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Project,
    Service,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Project => "project",
            EntityType::Service => "service",
        }
    }

    /// Top-level folder under the media root
    pub fn dir_name(&self) -> &'static str {
        match self {
            EntityType::Project => "projects",
            EntityType::Service => "services",
        }
    }

    pub fn with_id(self, id: u64) -> EntityRef {
        match self {
            EntityType::Project => EntityRef::Project(id),
            EntityType::Service => EntityRef::Service(id),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "project" | "projects" => Ok(EntityType::Project),
            "service" | "services" => Ok(EntityType::Service),
            other => Err(PipelineError::InvalidInput {
                message: format!("Unknown entity type '{}'", other),
            }),
        }
    }
}

/// Identity of an entity whose images are managed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum EntityRef {
    Project(u64),
    Service(u64),
}

impl EntityRef {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityRef::Project(_) => EntityType::Project,
            EntityRef::Service(_) => EntityType::Service,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            EntityRef::Project(id) | EntityRef::Service(id) => *id,
        }
    }

    /// Stable string key, e.g. `project:42`
    pub fn key(&self) -> String {
        format!("{}:{}", self.entity_type(), self.id())
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type(), self.id())
    }
}

/// What the pipeline needs to know about a CRUD record
pub trait MediaEntity {
    fn entity_ref(&self) -> EntityRef;

    fn title(&self) -> &str;

    /// Ordered list of original uploads
    fn image_sources(&self) -> Vec<(ImageRole, PathBuf)>;
}

/// Portfolio project record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,
    pub title: String,
    pub primary_image: Option<PathBuf>,
    pub album: Vec<PathBuf>,
}

/// Offered service record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: u64,
    pub title: String,
    pub primary_image: Option<PathBuf>,
    pub album: Vec<PathBuf>,
}

fn collect_sources(primary: &Option<PathBuf>, album: &[PathBuf]) -> Vec<(ImageRole, PathBuf)> {
    primary
        .iter()
        .map(|p| (ImageRole::Primary, p.clone()))
        .chain(album.iter().map(|p| (ImageRole::Album, p.clone())))
        .collect()
}

impl MediaEntity for Project {
    fn entity_ref(&self) -> EntityRef {
        EntityRef::Project(self.id)
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn image_sources(&self) -> Vec<(ImageRole, PathBuf)> {
        collect_sources(&self.primary_image, &self.album)
    }
}

impl MediaEntity for Service {
    fn entity_ref(&self) -> EntityRef {
        EntityRef::Service(self.id)
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn image_sources(&self) -> Vec<(ImageRole, PathBuf)> {
        collect_sources(&self.primary_image, &self.album)
    }
}

/// Role of an image within its entity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ImageRole {
    Primary,
    Album,
}

impl ImageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageRole::Primary => "primary",
            ImageRole::Album => "album",
        }
    }
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (size tier, format) output of a source image
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct VariantKey {
    pub tier: String,
    pub format: ImageFormat,
}

impl VariantKey {
    pub fn new(tier: impl Into<String>, format: ImageFormat) -> Self {
        Self {
            tier: tier.into(),
            format,
        }
    }

    /// File name suffix, e.g. `medium.webp`
    pub fn suffix(&self) -> String {
        format!("{}.{}", self.tier, self.format.extension())
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.suffix())
    }
}

impl From<VariantKey> for String {
    fn from(key: VariantKey) -> Self {
        key.suffix()
    }
}

impl TryFrom<String> for VariantKey {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let (tier, ext) = value
            .rsplit_once('.')
            .ok_or_else(|| format!("variant key '{}' has no format suffix", value))?;
        let format = ImageFormat::from_extension(ext)
            .ok_or_else(|| format!("variant key '{}' has unknown format", value))?;
        Ok(VariantKey::new(tier, format))
    }
}

/// One physical raster file belonging to an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub source_path: PathBuf,
    pub role: ImageRole,
    /// Populated only after successful optimization
    #[serde(default)]
    pub variants: BTreeMap<VariantKey, PathBuf>,
}

impl ImageAsset {
    pub fn new(source_path: impl Into<PathBuf>, role: ImageRole) -> Self {
        Self {
            source_path: source_path.into(),
            role,
            variants: BTreeMap::new(),
        }
    }

    pub fn primary(source_path: impl Into<PathBuf>) -> Self {
        Self::new(source_path, ImageRole::Primary)
    }

    pub fn album(source_path: impl Into<PathBuf>) -> Self {
        Self::new(source_path, ImageRole::Album)
    }

    /// File stem used to name variants
    pub fn basename(&self) -> Result<String> {
        self.source_path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| PipelineError::InvalidInput {
                message: format!("Asset path has no usable file name: {}", self.source_path.display()),
            })
    }

    /// Short stable tag derived from the source path
    ///
    /// Separates variants of sources that share a file stem.
    pub fn source_tag(&self) -> String {
        let digest = Sha256::digest(self.source_path.to_string_lossy().as_bytes());
        hex::encode(&digest[..4])
    }

    /// Rewrite paths that live under `old_root` to live under `new_root`
    pub fn rebase(&mut self, old_root: &Path, new_root: &Path) -> bool {
        let mut changed = false;
        if let Some(rebased) = rebase_path(&self.source_path, old_root, new_root) {
            self.source_path = rebased;
            changed = true;
        }
        for path in self.variants.values_mut() {
            if let Some(rebased) = rebase_path(path, old_root, new_root) {
                *path = rebased;
                changed = true;
            }
        }
        changed
    }
}

pub(crate) fn rebase_path(path: &Path, old_root: &Path, new_root: &Path) -> Option<PathBuf> {
    path.strip_prefix(old_root).ok().map(|rest| new_root.join(rest))
}

/// A unit of background work: optimize every asset of one entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationTask {
    pub id: TaskId,
    pub entity: EntityRef,
    pub assets: Vec<ImageAsset>,
    pub requested_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl OptimizationTask {
    pub fn new(entity: EntityRef, assets: Vec<ImageAsset>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity,
            assets,
            requested_at: Utc::now(),
            attempt_count: 0,
        }
    }
}

/// Result of a processed task, handed to the result sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub entity: EntityRef,
    /// Assets with their produced variants
    pub assets: Vec<ImageAsset>,
    /// Assets that could not be optimized and were logged as failed
    pub failed_assets: Vec<PathBuf>,
    /// The entity lost its folder while the task ran; nothing was written
    pub skipped: bool,
}

/// Entry of the permanently-failed log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub task_id: TaskId,
    pub entity: EntityRef,
    pub asset: Option<PathBuf>,
    pub kind: String,
    pub message: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn from_error(
        task: &OptimizationTask,
        asset: Option<&Path>,
        error: &PipelineError,
    ) -> Self {
        Self {
            task_id: task.id,
            entity: task.entity,
            asset: asset.map(Path::to_path_buf),
            kind: error.error_type().to_string(),
            message: error.to_string(),
            attempts: task.attempt_count,
            failed_at: Utc::now(),
        }
    }
}
