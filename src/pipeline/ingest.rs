//! Photo acquisition: download with retries, dual-write staging,
//! validation, and temp-file lifecycle.
//!
//! A downloaded photo is written twice in one staging step: a temp copy
//! that lives only while extraction is in flight, and a permanent copy
//! under the archive directory, one subdirectory per document kind. The
//! temp copy is held by a [`TempFileGuard`] that deletes it on drop, so
//! every exit path — success, failure, timeout — cleans up. A periodic
//! sweep removes temp files orphaned by process crashes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::DocumentKind;

/// Minimum image side length accepted for extraction.
pub const MIN_IMAGE_DIMENSION: u32 = 100;
/// Minimum image file size accepted for extraction.
pub const MIN_IMAGE_BYTES: u64 = 1024;

/// Outcome of one photo fetch attempt, split by whether retrying can help.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Worth retrying: network hiccups, rate limits, server errors.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Retrying cannot help: the photo is gone or access is denied.
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("photo download failed after {attempts} attempts: {reason}")]
    DownloadFailed { attempts: u32, reason: String },

    /// The downloaded file is not a usable photo.
    #[error("image rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where photo bytes come from. Production wires the chat platform's file
/// API behind this; tests use [`MockPhotoSource`].
pub trait PhotoSource: Send + Sync {
    /// Fetch the most recent photo the user sent.
    fn fetch(&self, user_id: i64) -> Result<Vec<u8>, FetchError>;
}

/// A temp file that deletes itself on drop.
#[derive(Debug)]
struct TempFileGuard {
    path: PathBuf,
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove temp file");
            }
        } else {
            debug!(path = %self.path.display(), "Temp file removed");
        }
    }
}

/// A successfully staged photo: a permanent archive copy plus a temp copy
/// whose lifetime bounds the extraction attempt. Dropping the value
/// removes the temp copy; the archive copy stays.
#[derive(Debug)]
pub struct StagedImage {
    saved_path: PathBuf,
    temp: TempFileGuard,
}

impl StagedImage {
    /// The permanent copy extraction reads from.
    pub fn saved_path(&self) -> &Path {
        &self.saved_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp.path
    }
}

/// Downloads, stages, and validates document photos.
pub struct ImageIngestor {
    temp_dir: PathBuf,
    archive_dir: PathBuf,
    retries: u32,
    retry_delay: Duration,
}

impl ImageIngestor {
    pub fn new(temp_dir: &Path, archive_dir: &Path, retries: u32, retry_delay: Duration) -> Self {
        Self {
            temp_dir: temp_dir.to_path_buf(),
            archive_dir: archive_dir.to_path_buf(),
            retries: retries.max(1),
            retry_delay,
        }
    }

    /// Download a photo and write it to both locations, then validate it.
    ///
    /// An attempt only counts as successful once both writes land;
    /// transient fetch failures and write errors are retried up to the
    /// configured attempt count with a fixed delay, permanent fetch
    /// failures abort immediately. A photo that fails validation is
    /// rejected without further retries; its temp copy is removed but the
    /// archive copy is kept, since nothing ever deletes from the archive.
    pub async fn stage(
        &self,
        source: &dyn PhotoSource,
        user_id: i64,
        kind: DocumentKind,
    ) -> Result<StagedImage, IngestError> {
        let mut last_reason = String::new();
        for attempt in 1..=self.retries {
            let bytes = match source.fetch(user_id) {
                Ok(bytes) => bytes,
                Err(FetchError::Permanent(reason)) => {
                    return Err(IngestError::DownloadFailed {
                        attempts: attempt,
                        reason,
                    });
                }
                Err(FetchError::Transient(reason)) => {
                    warn!(user_id, attempt, retries = self.retries, %reason, "Photo fetch failed");
                    last_reason = reason;
                    if attempt < self.retries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                    continue;
                }
            };

            match self.write_both(&bytes, user_id, kind) {
                Ok(staged) => {
                    if let Err(reason) = validate(staged.saved_path()) {
                        warn!(user_id, %reason, "Downloaded photo rejected");
                        drop(staged);
                        return Err(IngestError::Rejected(reason));
                    }
                    debug!(
                        user_id,
                        temp = %staged.temp_path().display(),
                        saved = %staged.saved_path().display(),
                        "Photo staged and validated"
                    );
                    return Ok(staged);
                }
                Err(e) => {
                    warn!(user_id, attempt, error = %e, "Staging write failed");
                    last_reason = e.to_string();
                    if attempt < self.retries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(IngestError::DownloadFailed {
            attempts: self.retries,
            reason: last_reason,
        })
    }

    fn write_both(
        &self,
        bytes: &[u8],
        user_id: i64,
        kind: DocumentKind,
    ) -> std::io::Result<StagedImage> {
        let perm_dir = self.archive_dir.join(kind.as_str());
        std::fs::create_dir_all(&self.temp_dir)?;
        std::fs::create_dir_all(&perm_dir)?;

        let filename = format!("{}_{}.jpg", user_id, Utc::now().format("%Y%m%d_%H%M%S"));
        let temp_path = self.temp_dir.join(&filename);
        let saved_path = perm_dir.join(&filename);

        std::fs::write(&temp_path, bytes)?;
        let temp = TempFileGuard { path: temp_path };
        std::fs::copy(&temp.path, &saved_path)?;
        info!(saved = %saved_path.display(), "Photo archived");
        Ok(StagedImage { saved_path, temp })
    }

    /// Remove temp files older than `max_age`, e.g. left behind by a crash
    /// mid-extraction. Returns the number of files removed.
    pub fn cleanup_orphaned_temp_files(&self, max_age: Duration) -> Result<usize, IngestError> {
        if !self.temp_dir.exists() {
            return Ok(0);
        }
        let now = std::time::SystemTime::now();
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.temp_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= max_age {
                if std::fs::remove_file(&path).is_ok() {
                    info!(path = %path.display(), age_secs = age.as_secs(), "Removed orphaned temp file");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Check that a downloaded file is plausibly a card photo: large enough on
/// disk, decodable, and at least 100×100 pixels. Returns the rejection
/// reason on failure.
pub fn validate(path: &Path) -> Result<(), String> {
    let size = std::fs::metadata(path)
        .map_err(|e| format!("cannot stat file: {e}"))?
        .len();
    if size < MIN_IMAGE_BYTES {
        return Err(format!(
            "file too small ({size} bytes, minimum {MIN_IMAGE_BYTES})"
        ));
    }
    let img = image::open(path).map_err(|e| format!("not a decodable image: {e}"))?;
    let (w, h) = (img.width(), img.height());
    if w < MIN_IMAGE_DIMENSION || h < MIN_IMAGE_DIMENSION {
        return Err(format!(
            "dimensions too small ({w}x{h}, minimum {MIN_IMAGE_DIMENSION}x{MIN_IMAGE_DIMENSION})"
        ));
    }
    Ok(())
}

/// Scripted photo source for tests: pops one queued result per fetch and
/// counts calls.
pub struct MockPhotoSource {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<Vec<u8>, FetchError>>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl MockPhotoSource {
    pub fn new(responses: Vec<Result<Vec<u8>, FetchError>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl PhotoSource for MockPhotoSource {
    fn fetch(&self, _user_id: i64) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| Err(FetchError::Permanent("no scripted response".into())))
    }
}
