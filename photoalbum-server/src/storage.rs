use crate::config::Settings;
use crate::encode::{self, EncodeOptions};
use crate::error::IngestError;
use crate::paths::{self, PathDeriver};
use crate::validate::{self, Candidate};
use chrono::{DateTime, Datelike, FixedOffset};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// A file as received from the upload handler.
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Vec<u8>,
    /// Length announced by the client, if any. The buffered length is used
    /// when it is larger.
    pub declared_len: Option<u64>,
    pub content_type: Option<String>,
    pub original_filename: String,
}

/// Handle returned to the record owner once an upload is on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub date: DateTime<FixedOffset>,
    pub dir: PathBuf,
    pub filename: String,
    pub original_filename: String,
    pub size: u64,
    pub mime_type: String,
}

impl StoredImage {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }
}

/// Upload pipeline and file handle operations over `<root>/photos`.
#[derive(Debug, Clone)]
pub struct PhotoStorage {
    paths: PathDeriver,
    max_upload_bytes: u64,
    encode: EncodeOptions,
}

impl PhotoStorage {
    pub fn new(settings: &Settings) -> Self {
        Self {
            paths: PathDeriver::new(&settings.storage_root),
            max_upload_bytes: settings.max_upload_bytes,
            encode: settings.encode,
        }
    }

    pub async fn init(&self) -> io::Result<()> {
        self.paths.ensure_root().await
    }

    pub fn photos_dir(&self) -> &Path {
        self.paths.photos_dir()
    }

    /// Validate, store and optimise one upload.
    ///
    /// Optimisation failures are logged and otherwise ignored: the raw upload
    /// stays on disk and the call still succeeds.
    pub async fn save_photo(
        &self,
        upload: Upload,
        date: DateTime<FixedOffset>,
    ) -> Result<StoredImage, IngestError> {
        let size = upload.bytes.len() as u64;
        let candidate = Candidate {
            len: upload.declared_len.unwrap_or(size).max(size),
            declared_type: upload.content_type.as_deref(),
            head: &upload.bytes,
        };
        let kind = validate::validate(&candidate, self.max_upload_bytes)?;

        let dir = self
            .paths
            .upload_dir(&date)
            .await
            .map_err(|source| IngestError::WriteFailure {
                path: self.paths.dir_for(&date),
                source,
            })?;
        let filename = paths::generate_filename(&upload.original_filename);
        let path = dir.join(&filename);

        if let Err(source) = fs::write(&path, &upload.bytes).await {
            if fs::try_exists(&path).await.unwrap_or(false) {
                let _ = fs::remove_file(&path).await;
            }
            return Err(IngestError::WriteFailure { path, source });
        }
        tracing::info!(path = %path.display(), size, mime = kind.mime(), "stored upload");

        self.optimize_stored(path.clone()).await;

        Ok(StoredImage {
            date,
            dir,
            filename,
            original_filename: upload.original_filename,
            size,
            mime_type: kind.mime().to_string(),
        })
    }

    /// Run the re-encoder on a blocking thread and wait for it. Never fails.
    async fn optimize_stored(&self, path: PathBuf) {
        let opts = self.encode;
        let target = path.clone();
        match tokio::task::spawn_blocking(move || encode::optimize_file(&target, &opts)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "image optimization failed; keeping original upload");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "image optimization task aborted; keeping original upload");
            }
        }
    }

    pub fn file_path<D: Datelike>(&self, filename: &str, date: &D) -> Option<PathBuf> {
        self.paths.file_path(filename, date)
    }

    pub async fn file_exists<D: Datelike>(&self, filename: &str, date: &D) -> bool {
        match self.file_path(filename, date) {
            Some(p) => fs::try_exists(&p).await.unwrap_or(false),
            None => false,
        }
    }

    /// Remove a stored file. `false` when it was missing or could not be removed.
    pub async fn delete_file<D: Datelike>(&self, filename: &str, date: &D) -> bool {
        let Some(path) = self.file_path(filename, date) else {
            return false;
        };
        match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to delete photo file");
                }
                false
            }
        }
    }

    /// Move a stored file to the directory of a new logical date. A missing
    /// source file is not an error.
    pub async fn relocate<A: Datelike, B: Datelike>(
        &self,
        filename: &str,
        from: &A,
        to: &B,
    ) -> io::Result<()> {
        let (Some(src), Some(_)) = (self.file_path(filename, from), self.file_path(filename, to))
        else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid stored filename '{filename}'"),
            ));
        };
        if self.paths.dir_for(from) == self.paths.dir_for(to) {
            return Ok(());
        }
        if !fs::try_exists(&src).await.unwrap_or(false) {
            tracing::warn!(path = %src.display(), "photo file missing; nothing to relocate");
            return Ok(());
        }
        let dir = self.paths.upload_dir(to).await?;
        let dst = dir.join(filename);
        fs::rename(&src, &dst).await?;
        tracing::info!(from = %src.display(), to = %dst.display(), "relocated photo file");
        Ok(())
    }
}
