//! Small async filesystem helpers shared by the storage layer.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio::fs;
use trove_core::error::{Result, TroveError};

/// Reads and deserializes a JSON file.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| TroveError::io(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content).map_err(|e| TroveError::Serialization {
        format: "JSON".to_string(),
        message: format!("{}: {}", path.display(), e),
    })
}

/// Reads a JSON file if it exists; `Ok(None)` when the file is absent.
pub async fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }
    read_json(path).await.map(Some)
}

/// Serializes a value as pretty-printed JSON and writes it with a trailing
/// newline, creating parent directories as needed.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TroveError::io(format!("Failed to create {}: {}", parent.display(), e)))?;
    }
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content + "\n")
        .await
        .map_err(|e| TroveError::io(format!("Failed to write {}: {}", path.display(), e)))
}

/// How a [`relocate`] call got the content to its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocateOutcome {
    /// Atomic rename succeeded.
    Renamed,
    /// Rename failed (e.g., cross-device); content was copied and the source
    /// removed.
    Copied,
    /// Content was copied but the source could not be removed. The content
    /// exists at both paths; never treated as a relocation failure.
    CopiedSourceRetained,
}

/// Moves a file or directory with an at-least-once contract: on success the
/// content is guaranteed present at `dst`; removal of `src` is best-effort.
///
/// Rename is attempted first. On failure the content is copied, the copy is
/// verified by size, and the source is deleted; a delete failure is logged
/// and reported via [`RelocateOutcome::CopiedSourceRetained`].
pub async fn relocate(src: &Path, dst: &Path) -> Result<RelocateOutcome> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TroveError::io(format!("Failed to create {}: {}", parent.display(), e)))?;
    }

    match fs::rename(src, dst).await {
        Ok(()) => return Ok(RelocateOutcome::Renamed),
        Err(e) => {
            tracing::warn!(
                "Rename {} -> {} failed ({}), falling back to copy",
                src.display(),
                dst.display(),
                e
            );
        }
    }

    let meta = fs::metadata(src)
        .await
        .map_err(|e| TroveError::io(format!("Failed to stat {}: {}", src.display(), e)))?;
    if meta.is_dir() {
        copy_dir_recursive(src, dst).await?;
    } else {
        let copied = fs::copy(src, dst)
            .await
            .map_err(|e| TroveError::io(format!("Failed to copy {}: {}", src.display(), e)))?;
        if copied != meta.len() {
            return Err(TroveError::io(format!(
                "Copy verification failed for {}: expected {} bytes, copied {}",
                src.display(),
                meta.len(),
                copied
            )));
        }
    }

    let removal = if meta.is_dir() {
        fs::remove_dir_all(src).await
    } else {
        fs::remove_file(src).await
    };
    match removal {
        Ok(()) => Ok(RelocateOutcome::Copied),
        Err(e) => {
            tracing::warn!(
                "Copied {} to {} but could not remove source: {}",
                src.display(),
                dst.display(),
                e
            );
            Ok(RelocateOutcome::CopiedSourceRetained)
        }
    }
}

/// Recursively copies a directory tree.
pub async fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)
        .await
        .map_err(|e| TroveError::io(format!("Failed to create {}: {}", dst.display(), e)))?;

    // Manual stack instead of recursion: async fns cannot recurse without
    // boxing, and trees here are shallow anyway.
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        let mut entries = fs::read_dir(&from)
            .await
            .map_err(|e| TroveError::io(format!("Failed to read {}: {}", from.display(), e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TroveError::io(e.to_string()))?
        {
            let target = to.join(entry.file_name());
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| TroveError::io(e.to_string()))?;
            if file_type.is_dir() {
                fs::create_dir_all(&target)
                    .await
                    .map_err(|e| TroveError::io(e.to_string()))?;
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), &target)
                    .await
                    .map_err(|e| TroveError::io(e.to_string()))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("data.json");

        write_json(&path, &json!({"a": 1})).await.unwrap();
        let value: serde_json::Value = read_json(&path).await.unwrap();
        assert_eq!(value["a"], 1);
    }

    #[tokio::test]
    async fn test_read_json_opt_missing() {
        let dir = TempDir::new().unwrap();
        let value: Option<serde_json::Value> =
            read_json_opt(&dir.path().join("missing.json")).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_relocate_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("sub").join("b.txt");
        tokio::fs::write(&src, b"content").await.unwrap();

        let outcome = relocate(&src, &dst).await.unwrap();
        assert_eq!(outcome, RelocateOutcome::Renamed);
        assert!(!src.exists());
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"content");
    }

    #[tokio::test]
    async fn test_relocate_directory() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("tree");
        tokio::fs::create_dir_all(src.join("inner")).await.unwrap();
        tokio::fs::write(src.join("inner").join("f.txt"), b"x")
            .await
            .unwrap();

        let dst = dir.path().join("moved");
        relocate(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert!(dst.join("inner").join("f.txt").exists());
    }

    #[tokio::test]
    async fn test_copy_dir_recursive() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        tokio::fs::create_dir_all(src.join("a/b")).await.unwrap();
        tokio::fs::write(src.join("a/b/deep.txt"), b"deep").await.unwrap();

        let dst = dir.path().join("dst");
        copy_dir_recursive(&src, &dst).await.unwrap();
        assert!(src.join("a/b/deep.txt").exists());
        assert_eq!(
            tokio::fs::read(dst.join("a/b/deep.txt")).await.unwrap(),
            b"deep"
        );
    }
}
