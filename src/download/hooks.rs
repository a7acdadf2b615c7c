//! Pluggable per-file hooks: validation, encryption and completion callbacks.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Callback invoked with the final path of every successfully stored file
pub type CompletionCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// Decides whether a freshly downloaded file is usable
///
/// A rejected file is deleted and its source is never requested again within
/// the same [`download`](super::download) call.
#[async_trait]
pub trait FileValidator: Send + Sync {
    /// Returns true if the file at `file` should be kept
    async fn is_valid(&self, file: &Path) -> bool;
}

/// Stream cipher applied to downloaded files
///
/// Runs on the blocking thread pool, so implementations may use plain
/// `std::io` readers and writers.
pub trait FileEncryptor: Send + Sync {
    /// Read plaintext from `input` and write ciphertext to `output`
    fn encrypt(&self, input: &mut dyn Read, output: &mut dyn Write) -> std::io::Result<()>;

    /// Read ciphertext from `input` and write plaintext to `output`
    fn decrypt(&self, input: &mut dyn Read, output: &mut dyn Write) -> std::io::Result<()>;
}

/// Optional hooks applied by the download engine
#[derive(Clone, Default)]
pub struct DownloadHooks {
    /// Validator run on every downloaded file
    pub validator: Option<Arc<dyn FileValidator>>,
    /// Encryptor that replaces every stored file with its ciphertext
    pub encryptor: Option<Arc<dyn FileEncryptor>>,
    /// Callback receiving the final path of every stored file
    pub on_complete: Option<CompletionCallback>,
}

impl DownloadHooks {
    /// Hooks with only a validator
    pub fn with_validator(validator: Arc<dyn FileValidator>) -> Self {
        Self {
            validator: Some(validator),
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for DownloadHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHooks")
            .field("validator", &self.validator.is_some())
            .field("encryptor", &self.encryptor.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Rejects empty files
#[derive(Debug, Clone, Copy, Default)]
pub struct NonEmptyValidator;

#[async_trait]
impl FileValidator for NonEmptyValidator {
    async fn is_valid(&self, file: &Path) -> bool {
        match tokio::fs::metadata(file).await {
            Ok(metadata) => metadata.len() > 0,
            Err(e) => {
                tracing::debug!(path = %file.display(), error = %e, "cannot stat downloaded file");
                false
            }
        }
    }
}

/// Checks files against expected SHA-256 digests, keyed by destination path
///
/// Files without an expected digest are accepted.
#[derive(Debug, Clone, Default)]
pub struct Sha256Validator {
    expected: HashMap<PathBuf, String>,
}

impl Sha256Validator {
    /// Create a validator from `destination -> lowercase hex digest`
    pub fn new(expected: HashMap<PathBuf, String>) -> Self {
        let expected = expected
            .into_iter()
            .map(|(path, digest)| (path, digest.to_ascii_lowercase()))
            .collect();
        Self { expected }
    }
}

/// Compute the lowercase hex SHA-256 digest of a file
pub async fn sha256_hex(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(std::io::Error::other)?
}

#[async_trait]
impl FileValidator for Sha256Validator {
    async fn is_valid(&self, file: &Path) -> bool {
        let Some(expected) = self.expected.get(file) else {
            return true;
        };
        match sha256_hex(file).await {
            Ok(actual) => {
                if &actual != expected {
                    tracing::warn!(
                        path = %file.display(),
                        expected = %expected,
                        actual = %actual,
                        "checksum mismatch"
                    );
                }
                &actual == expected
            }
            Err(e) => {
                tracing::warn!(
                    path = %file.display(),
                    error = %e,
                    "failed to hash downloaded file"
                );
                false
            }
        }
    }
}
