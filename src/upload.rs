//! ==============================================================================
//! upload.rs - video upload validation and storage
//! ==============================================================================
//!
//! purpose:
//!     validates the `my-video` multipart file from POST /upload-video and
//!     writes it under the uploads directory as `<unix-ms>-<sanitised name>`.
//!     files are created with create_new, so an existing upload is never
//!     overwritten; a numeric suffix is added instead.
//!
//! ==============================================================================

use std::io;
use std::path::Path;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::metrics::now_ms;

pub const FIELD_NAME: &str = "my-video";
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["mp4", "mpeg", "webm"];
/// 100 MB
pub const MAX_UPLOAD_BYTES: usize = 100_000_000;

const MAX_SUFFIX: u32 = 100;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Only videos are allowed with mp4, mpeg, webm extensions (got {0:?})")]
    BadExtension(String),
    #[error("missing `my-video` file field")]
    MissingFile,
    #[error("failed to store upload: {0}")]
    Io(#[from] io::Error),
}

impl UploadError {
    /// rejections the client can fix
    pub fn is_client_error(&self) -> bool {
        !matches!(self, UploadError::Io(_))
    }
}

/// mp4 / mpeg / webm, case-insensitive
pub fn validate_extension(filename: &str) -> Result<(), UploadError> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        _ => Err(UploadError::BadExtension(filename.to_string())),
    }
}

/// lowercase, accents stripped, spaces to `_`, only [a-z0-9._-] survive;
/// any client-side path is dropped
pub fn sanitize_name(original: &str) -> String {
    let base = original
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(original);

    // "í" decomposes to "i" + a combining accent
    base.nfd()
        .filter(|c| !is_combining_mark(*c))
        .filter_map(|c| match c.to_ascii_lowercase() {
            ' ' => Some('_'),
            c @ ('a'..='z' | '0'..='9' | '.' | '_' | '-') => Some(c),
            _ => None,
        })
        .collect()
}

pub fn stored_name(original: &str, unix_ms: i64) -> String {
    format!("{unix_ms}-{}", sanitize_name(original))
}

/// "123-clip.mp4", 2 -> "123-clip-2.mp4"
fn with_suffix(name: &str, n: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}-{n}.{ext}"),
        None => format!("{name}-{n}"),
    }
}

/// validate and write one upload; returns the stored file name
pub async fn store(dir: &Path, original: &str, bytes: &[u8]) -> Result<String, UploadError> {
    store_at(dir, original, bytes, now_ms()).await
}

async fn store_at(dir: &Path, original: &str, bytes: &[u8], unix_ms: i64) -> Result<String, UploadError> {
    validate_extension(original)?;
    tokio::fs::create_dir_all(dir).await?;

    let base = stored_name(original, unix_ms);
    for n in 0..MAX_SUFFIX {
        let name = if n == 0 { base.clone() } else { with_suffix(&base, n) };
        let path = dir.join(&name);

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                if let Err(e) = file.write_all(bytes).await {
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(e.into());
                }
                file.flush().await?;
                tracing::info!("[UPLOAD] stored {} ({} bytes)", name, bytes.len());
                return Ok(name);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(UploadError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {base}"),
    )))
}
