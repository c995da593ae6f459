//! Utility functions and helpers

use crate::error::{PipelineError, Result};
use std::path::{Path, PathBuf};

/// File utilities
pub mod file {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::io::Read;
    use tokio::io::AsyncWriteExt;

    /// Sibling temp path used while a file is being written
    pub fn temp_sibling(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
    }

    /// Temp file removed on drop unless it was renamed into place
    struct PendingTemp {
        path: PathBuf,
        committed: bool,
    }

    impl Drop for PendingTemp {
        fn drop(&mut self) {
            if !self.committed {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    /// Write a file so readers see either the old or the new content
    ///
    /// Data goes to a temp sibling first and is renamed into place. With
    /// `durable` the temp file is fsynced before the rename. The temp file is
    /// removed on failure and when the future is dropped early.
    pub async fn write_atomic(path: &Path, bytes: &[u8], durable: bool) -> std::io::Result<()> {
        let mut temp = PendingTemp {
            path: temp_sibling(path),
            committed: false,
        };

        let mut file = tokio::fs::File::create(&temp.path).await?;
        file.write_all(bytes).await?;
        if durable {
            file.sync_all().await?;
        }
        drop(file);
        tokio::fs::rename(&temp.path, path).await?;
        temp.committed = true;
        Ok(())
    }

    /// Hex-encoded SHA-256 of a file's content
    pub fn sha256_file(path: &Path) -> std::io::Result<String> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Number of files and directories below `path`, excluding `path` itself
    pub fn count_entries(path: &Path) -> usize {
        walkdir::WalkDir::new(path)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .count()
    }

    /// Whether a directory exists and holds at least one entry
    pub fn is_populated_dir(path: &Path) -> bool {
        std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }
}

/// Input validation utilities
pub mod validation {
    use super::*;

    /// A single path component that cannot escape its parent directory
    pub fn is_safe_component(name: &str) -> bool {
        !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0'])
    }

    /// Reject names that would not stay inside their directory
    pub fn validate_component(kind: &str, name: &str) -> Result<()> {
        if is_safe_component(name) {
            Ok(())
        } else {
            Err(PipelineError::InvalidInput {
                message: format!("Unsafe {} '{}'", kind, name),
            })
        }
    }
}
