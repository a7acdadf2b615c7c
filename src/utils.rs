//! Utility functions for file operations and path manipulation

use crate::error::{Error, ImportError, Result};
use std::path::Path;

/// Validate that `name` can be used as a single path component
///
/// Rejects empty names, `.`/`..`, path separators and NUL bytes, so a report id
/// coming from a remote payload can never escape the destination directory.
///
/// # Examples
///
/// ```
/// use report_ingest::utils::safe_component;
///
/// assert!(safe_component("RPT-0001").is_ok());
/// assert!(safe_component("../etc/passwd").is_err());
/// assert!(safe_component("").is_err());
/// ```
pub fn safe_component(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    let unsafe_name = trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\', '\0']);
    if unsafe_name {
        return Err(ImportError::UnsafeName(name.to_string()).into());
    }
    Ok(trimmed)
}

/// Create `dir` (and parents) if absent and check that it can be written to
///
/// Returns [`ImportError::InvalidDestination`] if the path exists but is not a
/// directory, or is marked read-only.
pub async fn ensure_writable_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        Error::Import(ImportError::InvalidDestination {
            path: dir.to_path_buf(),
            reason: format!("cannot create directory: {e}"),
        })
    })?;

    let metadata = tokio::fs::metadata(dir).await?;
    if !metadata.is_dir() {
        return Err(ImportError::InvalidDestination {
            path: dir.to_path_buf(),
            reason: "not a directory".to_string(),
        }
        .into());
    }
    if metadata.permissions().readonly() {
        return Err(ImportError::InvalidDestination {
            path: dir.to_path_buf(),
            reason: "directory is read-only".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success
pub async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Sibling path used for in-progress writes that are later renamed over `path`
pub fn staging_path(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
