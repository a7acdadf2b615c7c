//! Single-request transfer: stream the body to disk, then validate, encrypt and report.

use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use url::Url;

use super::hooks::{DownloadHooks, FileEncryptor};
use crate::error::{Error, Result};
use crate::utils::{remove_if_exists, staging_path};

/// Fetch `url` into `dest` and run the configured hooks.
///
/// Any failure leaves no file at `dest`.
pub(super) async fn transfer(
    client: &reqwest::Client,
    url: &Url,
    dest: &Path,
    hooks: &DownloadHooks,
) -> Result<PathBuf> {
    let result = fetch_and_finish(client, url, dest, hooks).await;
    if result.is_err()
        && let Err(e) = remove_if_exists(dest).await
    {
        tracing::warn!(path = %dest.display(), error = %e, "failed to remove partial file");
    }
    result
}

async fn fetch_and_finish(
    client: &reqwest::Client,
    url: &Url,
    dest: &Path,
    hooks: &DownloadHooks,
) -> Result<PathBuf> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let response = client.get(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Backend {
            message: format!("{url} returned {status}"),
            status: Some(status.as_u16()),
        });
    }

    write_body(response, dest).await?;

    if let Some(validator) = &hooks.validator
        && !validator.is_valid(dest).await
    {
        return Err(Error::Rejected {
            path: dest.to_path_buf(),
        });
    }

    if let Some(encryptor) = &hooks.encryptor {
        encrypt_in_place(Arc::clone(encryptor), dest).await?;
    }

    if let Some(on_complete) = &hooks.on_complete {
        on_complete(dest);
    }

    Ok(dest.to_path_buf())
}

/// Stream the response body into `dest`, checking the advertised length.
async fn write_body(response: reqwest::Response, dest: &Path) -> Result<()> {
    let expected = response.content_length();
    let mut file = tokio::fs::File::create(dest).await?;
    let mut written: u64 = 0;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    if let Some(expected) = expected
        && expected != written
    {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("body ended after {written} of {expected} bytes"),
        )));
    }
    Ok(())
}

/// Replace `path` with its ciphertext via a staging file and rename.
pub(super) async fn encrypt_in_place(encryptor: Arc<dyn FileEncryptor>, path: &Path) -> Result<()> {
    let plain = path.to_path_buf();
    let staging = staging_path(path, "enc");

    let outcome = {
        let plain = plain.clone();
        let staging = staging.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut input = std::fs::File::open(&plain)?;
            let mut output = std::fs::File::create(&staging)?;
            encryptor.encrypt(&mut input, &mut output)?;
            output.sync_all()?;
            drop(input);
            std::fs::rename(&staging, &plain)
        })
        .await
    };

    let reason = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => e.to_string(),
        Err(join) => join.to_string(),
    };
    if let Err(e) = remove_if_exists(&staging).await {
        tracing::debug!(path = %staging.display(), error = %e, "failed to remove staging file");
    }
    Err(Error::Encryption {
        path: plain,
        reason,
    })
}

/// Decrypt `encrypted` into `output` with the same encryptor used during download
pub async fn decrypt_file(
    encryptor: Arc<dyn FileEncryptor>,
    encrypted: &Path,
    output: &Path,
) -> Result<()> {
    let src = encrypted.to_path_buf();
    let dst = output.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut input = std::fs::File::open(&src)?;
        let mut out = std::fs::File::create(&dst)?;
        encryptor.decrypt(&mut input, &mut out)?;
        out.sync_all()
    })
    .await
    .map_err(|e| Error::Encryption {
        path: encrypted.to_path_buf(),
        reason: e.to_string(),
    })?
    .map_err(|e| Error::Encryption {
        path: encrypted.to_path_buf(),
        reason: e.to_string(),
    })
}
