//! Entity folder lifecycle
//!
//! Each project or service owns one directory tree under the media root:
//! `{root}/{projects|services}/{slug}/{primary|album}/...`. The slug an entity
//! currently uses is kept in a small JSON registry next to the trees so that
//! every process sharing the media root agrees on where variants go.

use crate::codec::VariantSet;
use crate::config::{FolderConfig, VariantLayout};
use crate::error::{PipelineError, Result};
use crate::models::{EntityRef, EntityType, ImageRole, VariantKey};
use crate::utils::{file, validation};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

/// Registry file name under the media root
pub const REGISTRY_FILE: &str = ".folder-registry.json";

const PRIMARY_SUBDIR: &str = "primary";
const ALBUM_SUBDIR: &str = "album";
const THUMBNAIL_SUBDIR: &str = "thumbnails";

/// Resolved location of one entity's image tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderHandle {
    pub root: PathBuf,
    pub entity_type: EntityType,
    pub entity_id: u64,
    pub entity_slug: String,
    pub album_subdir: String,
    pub thumbnail_subdir: Option<String>,
}

impl FolderHandle {
    pub fn entity(&self) -> EntityRef {
        self.entity_type.with_id(self.entity_id)
    }

    /// Top directory of the entity tree
    pub fn entity_dir(&self) -> PathBuf {
        self.root
            .join(self.entity_type.dir_name())
            .join(&self.entity_slug)
    }

    /// Directory holding the originals of one role
    pub fn role_dir(&self, role: ImageRole) -> PathBuf {
        match role {
            ImageRole::Primary => self.entity_dir().join(PRIMARY_SUBDIR),
            ImageRole::Album => self.entity_dir().join(&self.album_subdir),
        }
    }

    /// Directory variants of one role are written to
    pub fn variant_dir(&self, role: ImageRole) -> PathBuf {
        match &self.thumbnail_subdir {
            Some(subdir) => self.role_dir(role).join(subdir),
            None => self.role_dir(role),
        }
    }

    pub fn variant_path(&self, role: ImageRole, basename: &str, key: &VariantKey) -> PathBuf {
        self.variant_dir(role)
            .join(format!("{}.{}", basename, key.suffix()))
    }

    fn required_dirs(&self) -> Vec<PathBuf> {
        [ImageRole::Primary, ImageRole::Album]
            .into_iter()
            .map(|role| self.variant_dir(role))
            .collect()
    }
}

/// Exclusive hold on one entity's folder, from [`FolderManager::lock`]
///
/// Operations taking a guard run without locking again, so callers can keep
/// related bookkeeping inside the same critical section.
pub struct EntityGuard {
    entity: EntityRef,
    _guard: OwnedMutexGuard<()>,
}

impl EntityGuard {
    pub fn entity(&self) -> EntityRef {
        self.entity
    }

    fn check(&self, entity: EntityRef) -> Result<()> {
        if self.entity == entity {
            Ok(())
        } else {
            Err(PipelineError::InvalidInput {
                message: format!("lock held for {} but {} was requested", self.entity, entity),
            })
        }
    }
}

/// Variants written by [`FolderManager::write_variants`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenVariants {
    /// Folder the files landed in
    pub handle: FolderHandle,
    pub paths: BTreeMap<VariantKey, PathBuf>,
}

/// Result of [`FolderManager::prepare`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedFolder {
    pub handle: FolderHandle,
    /// Previous location the tree was moved from
    pub moved_from: Option<FolderHandle>,
}

/// Turn a title into a lowercase ASCII slug
///
/// Returns an empty string when the title has no ASCII letters or digits.
pub fn slugify(title: &str) -> String {
    static WORD: OnceLock<Regex> = OnceLock::new();
    let word = WORD.get_or_init(|| Regex::new("[a-z0-9]+").expect("static regex is valid"));

    let lowered = title.to_ascii_lowercase();
    word.find_iter(&lowered)
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryEntry {
    entity: EntityRef,
    slug: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    entries: BTreeMap<String, RegistryEntry>,
}

impl RegistryFile {
    fn slug_of(&self, entity: EntityRef) -> Option<&str> {
        self.entries
            .get(&entity.key())
            .map(|entry| entry.slug.as_str())
    }

    fn owner_of(&self, entity_type: EntityType, slug: &str) -> Option<EntityRef> {
        self.entries
            .values()
            .find(|entry| entry.entity.entity_type() == entity_type && entry.slug == slug)
            .map(|entry| entry.entity)
    }
}

/// Creates, renames and deletes entity folder trees
pub struct FolderManager {
    root: PathBuf,
    layout: VariantLayout,
    config: FolderConfig,
    registry: Mutex<RegistryFile>,
    entity_locks: Mutex<HashMap<EntityRef, Arc<Mutex<()>>>>,
}

impl FolderManager {
    /// Open the manager for a media root, loading the slug registry
    pub async fn open(
        root: impl Into<PathBuf>,
        layout: VariantLayout,
        config: FolderConfig,
    ) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let manager = Self {
            root,
            layout,
            config,
            registry: Mutex::new(RegistryFile::default()),
            entity_locks: Mutex::new(HashMap::new()),
        };
        manager.reload(&mut *manager.registry.lock().await).await?;
        Ok(manager)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> VariantLayout {
        self.layout
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    fn handle_for(&self, entity: EntityRef, slug: String) -> FolderHandle {
        FolderHandle {
            root: self.root.clone(),
            entity_type: entity.entity_type(),
            entity_id: entity.id(),
            entity_slug: slug,
            album_subdir: ALBUM_SUBDIR.to_string(),
            thumbnail_subdir: match self.layout {
                VariantLayout::Suffixed => None,
                VariantLayout::ThumbnailDir => Some(THUMBNAIL_SUBDIR.to_string()),
            },
        }
    }

    /// Serialize folder mutations of one entity
    pub async fn lock(&self, entity: EntityRef) -> EntityGuard {
        let lock = {
            let mut locks = self.entity_locks.lock().await;
            locks.entry(entity).or_default().clone()
        };
        EntityGuard {
            entity,
            _guard: lock.lock_owned().await,
        }
    }

    /// Re-read the registry so changes made by other processes are seen
    async fn reload(&self, registry: &mut RegistryFile) -> Result<()> {
        let path = self.registry_path();
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *registry = RegistryFile::default();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        *registry = match serde_json::from_slice(&content) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Folder registry is corrupt, starting empty");
                RegistryFile::default()
            }
        };
        Ok(())
    }

    async fn save_registry(&self, registry: &RegistryFile) -> Result<()> {
        let content = serde_json::to_vec_pretty(registry)?;
        file::write_atomic(&self.registry_path(), &content, true).await?;
        Ok(())
    }

    /// Deterministic folder for an entity with the given title
    ///
    /// An entity keeps its registered slug while the title still maps to it.
    /// A slug owned by another entity of the same type gets the id appended.
    pub async fn resolve(&self, entity: EntityRef, title: &str) -> Result<FolderHandle> {
        let mut registry = self.registry.lock().await;
        self.reload(&mut registry).await?;
        Ok(self.resolve_in(&registry, entity, title))
    }

    fn resolve_in(&self, registry: &RegistryFile, entity: EntityRef, title: &str) -> FolderHandle {
        let base = match slugify(title) {
            slug if slug.is_empty() => format!("{}-{}", entity.entity_type(), entity.id()),
            slug => slug,
        };
        let suffixed = format!("{}-{}", base, entity.id());

        if let Some(current) = registry.slug_of(entity) {
            if current == base || current == suffixed {
                return self.handle_for(entity, current.to_string());
            }
        }

        let slug = match registry.owner_of(entity.entity_type(), &base) {
            Some(owner) if owner != entity => suffixed,
            _ => base,
        };
        self.handle_for(entity, slug)
    }

    /// Folder the entity currently owns, if any
    pub async fn current(&self, entity: EntityRef) -> Result<Option<FolderHandle>> {
        let mut registry = self.registry.lock().await;
        self.reload(&mut registry).await?;
        Ok(registry
            .slug_of(entity)
            .map(|slug| self.handle_for(entity, slug.to_string())))
    }

    /// Create the folder tree and record it in the registry
    ///
    /// Fails with `FolderConflict` when the entity already owns a different
    /// folder; moving it is the job of [`rename`](Self::rename).
    pub async fn ensure(&self, handle: &FolderHandle) -> Result<()> {
        let guard = self.lock(handle.entity()).await;
        self.ensure_locked(&guard, handle).await
    }

    pub async fn ensure_locked(&self, guard: &EntityGuard, handle: &FolderHandle) -> Result<()> {
        guard.check(handle.entity())?;
        if let Some(current) = self.current(handle.entity()).await? {
            if current.entity_slug != handle.entity_slug {
                return Err(PipelineError::FolderConflict {
                    path: handle.entity_dir(),
                    message: format!("entity already uses {}", current.entity_dir().display()),
                });
            }
        }
        self.create_tree(handle).await
    }

    async fn create_tree(&self, handle: &FolderHandle) -> Result<()> {
        for dir in handle.required_dirs() {
            tokio::fs::create_dir_all(&dir).await?;
        }
        self.register(handle).await
    }

    async fn register(&self, handle: &FolderHandle) -> Result<()> {
        let entity = handle.entity();
        let mut registry = self.registry.lock().await;
        self.reload(&mut registry).await?;

        if let Some(owner) = registry.owner_of(handle.entity_type, &handle.entity_slug) {
            if owner != entity {
                return Err(PipelineError::FolderConflict {
                    path: handle.entity_dir(),
                    message: format!("slug already owned by {}", owner),
                });
            }
        }
        if registry.slug_of(entity) == Some(handle.entity_slug.as_str()) {
            return Ok(());
        }

        registry.entries.insert(
            entity.key(),
            RegistryEntry {
                entity,
                slug: handle.entity_slug.clone(),
            },
        );
        self.save_registry(&registry).await
    }

    async fn unregister(&self, entity: EntityRef) -> Result<()> {
        let mut registry = self.registry.lock().await;
        self.reload(&mut registry).await?;
        if registry.entries.remove(&entity.key()).is_some() {
            self.save_registry(&registry).await?;
        }
        Ok(())
    }

    /// Resolve and create the folder for a title
    ///
    /// A tree still sitting under a previous title is moved first; the
    /// returned `moved_from` names it so callers can rewrite stored paths.
    #[instrument(skip(self))]
    pub async fn prepare(&self, entity: EntityRef, title: &str) -> Result<PreparedFolder> {
        let guard = self.lock(entity).await;
        self.prepare_locked(&guard, title).await
    }

    pub async fn prepare_locked(&self, guard: &EntityGuard, title: &str) -> Result<PreparedFolder> {
        let entity = guard.entity();
        let (current, target) = {
            let mut registry = self.registry.lock().await;
            self.reload(&mut registry).await?;
            let current = registry
                .slug_of(entity)
                .map(|slug| self.handle_for(entity, slug.to_string()));
            (current, self.resolve_in(&registry, entity, title))
        };

        let moved_from = current.filter(|c| c != &target);
        if let Some(current) = &moved_from {
            info!(
                entity = %entity,
                from = %current.entity_slug,
                to = %target.entity_slug,
                "Migrating folder left behind by a missed rename"
            );
            match self.move_tree(current, &target).await {
                Ok(()) => {}
                Err(PipelineError::FolderDeleteIncomplete { path, remaining, message }) => {
                    warn!(path = %path.display(), remaining, %message, "Old folder left behind after migration");
                }
                Err(e) => return Err(e),
            }
        }
        self.create_tree(&target).await?;
        Ok(PreparedFolder {
            handle: target,
            moved_from,
        })
    }

    /// Move an entity tree to a new location
    ///
    /// A plain rename is tried first. When that fails the tree is copied and
    /// every file is verified by size and SHA-256; the registry then points at
    /// the copy and the original is removed. An original that cannot be
    /// removed is reported as `FolderDeleteIncomplete` after the move took
    /// effect.
    #[instrument(skip(self, old, new), fields(from = %old.entity_dir().display(), to = %new.entity_dir().display()))]
    pub async fn rename(&self, old: &FolderHandle, new: &FolderHandle) -> Result<()> {
        if old.entity() != new.entity() {
            return Err(PipelineError::InvalidInput {
                message: format!("cannot move {} into the folder of {}", old.entity(), new.entity()),
            });
        }
        let guard = self.lock(old.entity()).await;
        self.rename_locked(&guard, old, new).await
    }

    pub async fn rename_locked(
        &self,
        guard: &EntityGuard,
        old: &FolderHandle,
        new: &FolderHandle,
    ) -> Result<()> {
        guard.check(old.entity())?;
        guard.check(new.entity())?;
        self.move_tree(old, new).await
    }

    async fn move_tree(&self, old: &FolderHandle, new: &FolderHandle) -> Result<()> {
        let from = old.entity_dir();
        let to = new.entity_dir();

        if from == to {
            return self.register(new).await;
        }
        if file::is_populated_dir(&to) {
            return Err(PipelineError::FolderConflict {
                path: to,
                message: "destination already contains files".to_string(),
            });
        }
        if !tokio::fs::try_exists(&from).await? {
            debug!("Source folder missing, updating registry only");
            return self.register(new).await;
        }

        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // An empty destination directory would make rename fail on some platforms
        let _ = tokio::fs::remove_dir(&to).await;

        match tokio::fs::rename(&from, &to).await {
            Ok(()) => {
                debug!("Renamed folder in place");
                self.register(new).await?;
            }
            Err(e) => {
                debug!(error = %e, "In-place rename failed, copying tree");
                self.move_by_copy(&from, &to, new).await?;
            }
        }

        info!(entity = %new.entity(), slug = %new.entity_slug, "Moved entity folder");
        Ok(())
    }

    /// Copy and verify, switch the registry, then remove the original
    async fn move_by_copy(&self, from: &Path, to: &Path, new: &FolderHandle) -> Result<()> {
        let (src, dst) = (from.to_path_buf(), to.to_path_buf());
        let files = tokio::task::spawn_blocking(move || copy_verified(&src, &dst))
            .await
            .map_err(|e| PipelineError::TransientIo {
                path: from.to_path_buf(),
                message: format!("copy task failed: {}", e),
            })??;
        debug!(files, "Verified copied tree");

        self.register(new).await?;
        self.remove_tree(from).await
    }

    /// Remove a directory tree, retrying with exponential backoff
    ///
    /// A missing directory counts as removed.
    async fn remove_tree(&self, dir: &Path) -> Result<()> {
        let attempts = self.config.delete_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.delete_backoff_ms);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    warn!(attempt, path = %dir.display(), error = %e, "Folder delete failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(PipelineError::FolderDeleteIncomplete {
            path: dir.to_path_buf(),
            remaining: file::count_entries(dir),
            message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Remove an entity tree
    ///
    /// Missing folders count as deleted. Locked files are retried with
    /// exponential backoff; the registry entry is only dropped once the tree
    /// is gone.
    #[instrument(skip(self, handle), fields(path = %handle.entity_dir().display()))]
    pub async fn delete(&self, handle: &FolderHandle) -> Result<()> {
        let guard = self.lock(handle.entity()).await;
        self.delete_locked(&guard, handle).await
    }

    pub async fn delete_locked(&self, guard: &EntityGuard, handle: &FolderHandle) -> Result<()> {
        guard.check(handle.entity())?;
        self.remove_tree(&handle.entity_dir()).await?;
        self.unregister(handle.entity()).await?;
        info!(entity = %handle.entity(), "Deleted entity folder");
        Ok(())
    }

    /// Write encoded variants into the entity's current folder
    ///
    /// Returns `None` when the entity no longer owns a folder.
    pub async fn write_variants(
        &self,
        entity: EntityRef,
        role: ImageRole,
        basename: &str,
        variants: &VariantSet,
    ) -> Result<Option<WrittenVariants>> {
        let guard = self.lock(entity).await;
        self.write_variants_locked(&guard, role, basename, variants).await
    }

    pub async fn write_variants_locked(
        &self,
        guard: &EntityGuard,
        role: ImageRole,
        basename: &str,
        variants: &VariantSet,
    ) -> Result<Option<WrittenVariants>> {
        validation::validate_component("basename", basename)?;

        let entity = guard.entity();
        let handle = match self.current(entity).await? {
            Some(handle) => handle,
            None => return Ok(None),
        };
        for dir in handle.required_dirs() {
            tokio::fs::create_dir_all(&dir).await?;
        }

        let mut written = BTreeMap::new();
        for (key, variant) in variants {
            let path = handle.variant_path(role, basename, key);
            file::write_atomic(&path, &variant.bytes, false)
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => PipelineError::FolderConflict {
                        path: path.clone(),
                        message: "folder moved while writing".to_string(),
                    },
                    _ => PipelineError::TransientIo {
                        path: path.clone(),
                        message: e.to_string(),
                    },
                })?;
            written.insert(key.clone(), path);
        }

        debug!(entity = %entity, count = written.len(), "Wrote variants");
        Ok(Some(WrittenVariants {
            handle,
            paths: written,
        }))
    }
}

/// Copy a tree and verify every file; a failed copy is removed again
fn copy_verified(from: &Path, to: &Path) -> Result<usize> {
    let copy_error = |path: &Path, e: &dyn std::fmt::Display| PipelineError::TransientIo {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let result = (|| -> Result<usize> {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(from) {
            let entry = entry.map_err(|e| copy_error(from, &e))?;
            let relative = entry
                .path()
                .strip_prefix(from)
                .map_err(|e| copy_error(entry.path(), &e))?;
            let target = to.join(relative);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                std::fs::copy(entry.path(), &target)?;
                files.push((entry.path().to_path_buf(), target));
            }
        }

        for (source, target) in &files {
            let same_size = std::fs::metadata(source)?.len() == std::fs::metadata(target)?.len();
            if !same_size || file::sha256_file(source)? != file::sha256_file(target)? {
                return Err(copy_error(target, &"copied file does not match its source"));
            }
        }
        Ok(files.len())
    })();

    if result.is_err() {
        let _ = std::fs::remove_dir_all(to);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EncodedVariant;
    use crate::config::ImageFormat;
    use proptest::prelude::*;
    use tempfile::tempdir;

    async fn manager(root: &Path) -> FolderManager {
        FolderManager::open(root, VariantLayout::Suffixed, FolderConfig::default())
            .await
            .unwrap()
    }

    fn variant_set() -> VariantSet {
        let mut set = VariantSet::new();
        set.insert(
            VariantKey::new("small", ImageFormat::WebP),
            EncodedVariant {
                bytes: vec![1, 2, 3],
                width: 4,
                height: 3,
                format: ImageFormat::WebP,
            },
        );
        set
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Lighthouse Villa"), "lighthouse-villa");
        assert_eq!(slugify("  Lighthouse   Villa II!  "), "lighthouse-villa-ii");
        assert_eq!(slugify("Café — Déjà vu"), "caf-d-j-vu");
        assert_eq!(slugify("日本"), "");
    }

    #[tokio::test]
    async fn test_resolve_is_deterministic() {
        let dir = tempdir().unwrap();
        let folders = manager(dir.path()).await;
        let entity = EntityRef::Project(42);

        let a = folders.resolve(entity, "Lighthouse Villa").await.unwrap();
        let b = folders.resolve(entity, "Lighthouse Villa").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a.entity_dir(),
            dir.path().join("projects").join("lighthouse-villa")
        );

        let empty = folders.resolve(EntityRef::Service(7), "???").await.unwrap();
        assert_eq!(empty.entity_slug, "service-7");
    }

    #[tokio::test]
    async fn test_slug_collision_appends_id() {
        let dir = tempdir().unwrap();
        let folders = manager(dir.path()).await;

        let first = folders.resolve(EntityRef::Project(1), "Villa").await.unwrap();
        folders.ensure(&first).await.unwrap();

        let second = folders.resolve(EntityRef::Project(2), "Villa").await.unwrap();
        assert_eq!(second.entity_slug, "villa-2");
        folders.ensure(&second).await.unwrap();

        // Services live in their own namespace
        let service = folders.resolve(EntityRef::Service(3), "Villa").await.unwrap();
        assert_eq!(service.entity_slug, "villa");

        // Registered suffixed slug stays stable
        let again = folders.resolve(EntityRef::Project(2), "Villa").await.unwrap();
        assert_eq!(again, second);
    }

    #[tokio::test]
    async fn test_ensure_is_concurrency_safe() {
        let dir = tempdir().unwrap();
        let folders = Arc::new(manager(dir.path()).await);
        let handle = folders.resolve(EntityRef::Project(5), "Harbor").await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let folders = folders.clone();
                let handle = handle.clone();
                tokio::spawn(async move { folders.ensure(&handle).await })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        assert!(handle.role_dir(ImageRole::Primary).is_dir());
        assert!(handle.role_dir(ImageRole::Album).is_dir());
        assert_eq!(
            folders.current(EntityRef::Project(5)).await.unwrap(),
            Some(handle)
        );
    }

    #[tokio::test]
    async fn test_rename_moves_tree() {
        let dir = tempdir().unwrap();
        let folders = manager(dir.path()).await;
        let entity = EntityRef::Project(42);

        let old = folders.resolve(entity, "Lighthouse Villa").await.unwrap();
        folders.ensure(&old).await.unwrap();
        folders
            .write_variants(entity, ImageRole::Primary, "front", &variant_set())
            .await
            .unwrap();

        let new = folders.resolve(entity, "Lighthouse Villa II").await.unwrap();
        folders.rename(&old, &new).await.unwrap();

        assert!(!old.entity_dir().exists());
        assert!(new
            .variant_path(ImageRole::Primary, "front", &VariantKey::new("small", ImageFormat::WebP))
            .is_file());
        assert_eq!(folders.current(entity).await.unwrap(), Some(new.clone()));
        assert_eq!(folders.resolve(entity, "Lighthouse Villa II").await.unwrap(), new);
    }

    #[tokio::test]
    async fn test_rename_into_populated_destination_conflicts() {
        let dir = tempdir().unwrap();
        let folders = manager(dir.path()).await;
        let entity = EntityRef::Project(1);

        let old = folders.resolve(entity, "Old").await.unwrap();
        folders.ensure(&old).await.unwrap();
        let new = folders.resolve(entity, "New").await.unwrap();
        std::fs::create_dir_all(new.entity_dir()).unwrap();
        std::fs::write(new.entity_dir().join("stray.txt"), b"x").unwrap();

        let err = folders.rename(&old, &new).await.unwrap_err();
        assert_eq!(err.error_type(), "folder_conflict");
        assert!(old.entity_dir().exists());
    }

    #[tokio::test]
    async fn test_rename_with_missing_source_updates_registry() {
        let dir = tempdir().unwrap();
        let folders = manager(dir.path()).await;
        let entity = EntityRef::Service(9);

        let old = folders.resolve(entity, "Old").await.unwrap();
        let new = folders.resolve(entity, "New").await.unwrap();
        folders.rename(&old, &new).await.unwrap();
        assert_eq!(folders.current(entity).await.unwrap(), Some(new));
    }

    #[test]
    fn test_copy_verified() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("from");
        let to = dir.path().join("to");
        std::fs::create_dir_all(from.join("album")).unwrap();
        std::fs::write(from.join("album").join("a.webp"), b"aaaa").unwrap();
        std::fs::write(from.join("b.txt"), b"bb").unwrap();

        assert_eq!(copy_verified(&from, &to).unwrap(), 2);

        assert!(from.join("b.txt").is_file(), "source is left for the caller");
        assert_eq!(std::fs::read(to.join("album").join("a.webp")).unwrap(), b"aaaa");
        assert_eq!(std::fs::read(to.join("b.txt")).unwrap(), b"bb");
    }

    #[test]
    fn test_copy_verified_missing_source_leaves_nothing() {
        let dir = tempdir().unwrap();
        let to = dir.path().join("to");

        assert!(copy_verified(&dir.path().join("absent"), &to).is_err());
        assert!(!to.exists());
    }

    #[tokio::test]
    async fn test_move_by_copy_switches_registry_and_removes_source() {
        let dir = tempdir().unwrap();
        let folders = manager(dir.path()).await;
        let entity = EntityRef::Project(21);

        let old = folders.prepare(entity, "Copied").await.unwrap().handle;
        std::fs::write(old.role_dir(ImageRole::Primary).join("a.webp"), b"a").unwrap();
        let new = folders.resolve(entity, "Copied Again").await.unwrap();

        folders
            .move_by_copy(&old.entity_dir(), &new.entity_dir(), &new)
            .await
            .unwrap();

        assert!(!old.entity_dir().exists());
        assert!(new.role_dir(ImageRole::Primary).join("a.webp").is_file());
        assert_eq!(folders.current(entity).await.unwrap(), Some(new));
    }

    /// Make `dir` read-only; returns false when the process can still write
    /// into it (running as root), in which case the caller skips the test.
    #[cfg(unix)]
    fn lock_dir(dir: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o555)).unwrap();
        let writable = std::fs::write(dir.join(".writable"), b"").is_ok();
        if writable {
            let _ = std::fs::remove_file(dir.join(".writable"));
            unlock_dir(dir);
        }
        !writable
    }

    #[cfg(unix)]
    fn unlock_dir(dir: &Path) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_move_by_copy_with_stuck_source_keeps_new_registry() {
        let dir = tempdir().unwrap();
        let config = FolderConfig {
            delete_attempts: 2,
            delete_backoff_ms: 1,
        };
        let folders = FolderManager::open(dir.path(), VariantLayout::Suffixed, config)
            .await
            .unwrap();
        let entity = EntityRef::Project(22);

        let old = folders.prepare(entity, "Stuck").await.unwrap().handle;
        let stuck = old.role_dir(ImageRole::Primary);
        std::fs::write(stuck.join("a.webp"), b"a").unwrap();
        if !lock_dir(&stuck) {
            return;
        }
        let new = folders.resolve(entity, "Unstuck").await.unwrap();

        let err = folders
            .move_by_copy(&old.entity_dir(), &new.entity_dir(), &new)
            .await
            .unwrap_err();
        unlock_dir(&stuck);

        assert_eq!(err.error_type(), "folder_delete_incomplete");
        assert_eq!(folders.current(entity).await.unwrap(), Some(new.clone()));
        assert!(new.role_dir(ImageRole::Primary).join("a.webp").is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_delete_with_locked_file_keeps_registry_entry() {
        let dir = tempdir().unwrap();
        let config = FolderConfig {
            delete_attempts: 2,
            delete_backoff_ms: 1,
        };
        let folders = FolderManager::open(dir.path(), VariantLayout::Suffixed, config)
            .await
            .unwrap();
        let entity = EntityRef::Service(23);

        let handle = folders.prepare(entity, "Pinned").await.unwrap().handle;
        let stuck = handle.role_dir(ImageRole::Album);
        std::fs::write(stuck.join("b.webp"), b"b").unwrap();
        if !lock_dir(&stuck) {
            return;
        }

        let err = folders.delete(&handle).await.unwrap_err();
        unlock_dir(&stuck);

        match err {
            PipelineError::FolderDeleteIncomplete { path, remaining, .. } => {
                assert_eq!(path, handle.entity_dir());
                assert!(remaining > 0);
            }
            other => panic!("expected incomplete delete, got {:?}", other),
        }
        assert_eq!(folders.current(entity).await.unwrap(), Some(handle.clone()));

        folders.delete(&handle).await.unwrap();
        assert_eq!(folders.current(entity).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ensure_rejects_second_slug() {
        let dir = tempdir().unwrap();
        let folders = manager(dir.path()).await;
        let entity = EntityRef::Project(24);

        let first = folders.prepare(entity, "One").await.unwrap().handle;
        let mut other = first.clone();
        other.entity_slug = "two".to_string();

        let err = folders.ensure(&other).await.unwrap_err();
        assert_eq!(err.error_type(), "folder_conflict");
        assert!(!other.entity_dir().exists());
        assert_eq!(folders.current(entity).await.unwrap(), Some(first.clone()));

        folders.ensure(&first).await.unwrap();
    }

    #[tokio::test]
    async fn test_guard_for_other_entity_is_rejected() {
        let dir = tempdir().unwrap();
        let folders = manager(dir.path()).await;
        let handle = folders.resolve(EntityRef::Project(25), "Mine").await.unwrap();

        let guard = folders.lock(EntityRef::Project(26)).await;
        let err = folders.ensure_locked(&guard, &handle).await.unwrap_err();
        assert_eq!(err.error_type(), "invalid_input");
        assert!(!handle.entity_dir().exists());
    }

    #[tokio::test]
    async fn test_lock_excludes_folder_operations() {
        let dir = tempdir().unwrap();
        let folders = Arc::new(manager(dir.path()).await);
        let entity = EntityRef::Project(27);
        let old = folders.prepare(entity, "Held").await.unwrap().handle;
        let new = folders.resolve(entity, "Moved").await.unwrap();

        let guard = folders.lock(entity).await;
        let rename = {
            let folders = folders.clone();
            let (old, new) = (old.clone(), new.clone());
            tokio::spawn(async move { folders.rename(&old, &new).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!rename.is_finished());
        assert!(old.entity_dir().exists());

        drop(guard);
        rename.await.unwrap().unwrap();
        assert_eq!(folders.current(entity).await.unwrap(), Some(new));
    }

    #[tokio::test]
    async fn test_delete_twice_is_noop() {
        let dir = tempdir().unwrap();
        let folders = manager(dir.path()).await;
        let entity = EntityRef::Project(3);

        let handle = folders.resolve(entity, "Gone Soon").await.unwrap();
        folders.ensure(&handle).await.unwrap();
        folders
            .write_variants(entity, ImageRole::Album, "shot", &variant_set())
            .await
            .unwrap();

        folders.delete(&handle).await.unwrap();
        assert!(!handle.entity_dir().exists());
        assert_eq!(folders.current(entity).await.unwrap(), None);

        folders.delete(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_variants_after_delete_is_skipped() {
        let dir = tempdir().unwrap();
        let folders = manager(dir.path()).await;
        let entity = EntityRef::Project(4);

        let handle = folders.resolve(entity, "Short Lived").await.unwrap();
        folders.ensure(&handle).await.unwrap();
        folders.delete(&handle).await.unwrap();

        let written = folders
            .write_variants(entity, ImageRole::Primary, "x", &variant_set())
            .await
            .unwrap();
        assert!(written.is_none());
        assert!(!handle.entity_dir().exists());
    }

    #[tokio::test]
    async fn test_thumbnail_dir_layout() {
        let dir = tempdir().unwrap();
        let folders = FolderManager::open(dir.path(), VariantLayout::ThumbnailDir, FolderConfig::default())
            .await
            .unwrap();
        let entity = EntityRef::Service(8);
        let handle = folders.resolve(entity, "Kitchen Remodel").await.unwrap();
        folders.ensure(&handle).await.unwrap();

        let written = folders
            .write_variants(entity, ImageRole::Album, "tile", &variant_set())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written.handle, handle);
        let path = &written.paths[&VariantKey::new("small", ImageFormat::WebP)];
        assert_eq!(
            path,
            &dir.path()
                .join("services/kitchen-remodel/album/thumbnails/tile.small.webp")
        );
    }

    #[tokio::test]
    async fn test_registry_shared_between_managers() {
        let dir = tempdir().unwrap();
        let first = manager(dir.path()).await;
        let second = manager(dir.path()).await;
        let entity = EntityRef::Project(11);

        let old = first.resolve(entity, "Before").await.unwrap();
        first.ensure(&old).await.unwrap();
        assert_eq!(second.current(entity).await.unwrap(), Some(old.clone()));

        let new = second.resolve(entity, "After").await.unwrap();
        second.rename(&old, &new).await.unwrap();
        assert_eq!(first.current(entity).await.unwrap(), Some(new));
    }

    #[tokio::test]
    async fn test_prepare_migrates_stale_folder() {
        let dir = tempdir().unwrap();
        let folders = manager(dir.path()).await;
        let entity = EntityRef::Project(12);

        let old = folders.prepare(entity, "First Title").await.unwrap().handle;
        std::fs::write(old.role_dir(ImageRole::Primary).join("keep.webp"), b"k").unwrap();

        let prepared = folders.prepare(entity, "Second Title").await.unwrap();
        assert_eq!(prepared.moved_from, Some(old.clone()));
        let new = prepared.handle;
        assert_eq!(new.entity_slug, "second-title");
        assert!(!old.entity_dir().exists());
        assert!(new.role_dir(ImageRole::Primary).join("keep.webp").is_file());
    }

    proptest! {
        #[test]
        fn prop_slug_is_path_safe(title in "\\PC{0,40}") {
            let slug = slugify(&title);
            prop_assert!(slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            prop_assert!(!slug.starts_with('-') && !slug.ends_with('-'));
            prop_assert!(!slug.contains("--"));
            prop_assert_eq!(slugify(&slug), slug.clone());
        }
    }
}
