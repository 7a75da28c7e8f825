//! Where uploads live on disk: `<root>/photos/<year>/<month>/<uuid><ext>`.

use chrono::Datelike;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone)]
pub struct PathDeriver {
    photos_dir: PathBuf,
}

impl PathDeriver {
    pub fn new(storage_root: &Path) -> Self {
        Self {
            photos_dir: storage_root.join("photos"),
        }
    }

    pub fn photos_dir(&self) -> &Path {
        &self.photos_dir
    }

    /// Create `<root>/photos` if it is missing.
    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.photos_dir).await
    }

    /// Directory for a logical date, without touching the filesystem.
    pub fn dir_for<D: Datelike>(&self, date: &D) -> PathBuf {
        self.photos_dir
            .join(date.year().to_string())
            .join(format!("{:02}", date.month()))
    }

    /// Directory for a logical date, created if absent. Concurrent callers
    /// racing on the same month all succeed.
    pub async fn upload_dir<D: Datelike>(&self, date: &D) -> io::Result<PathBuf> {
        let dir = self.dir_for(date);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Full path of a stored file. `None` if the filename would escape its
    /// month directory.
    pub fn file_path<D: Datelike>(&self, filename: &str, date: &D) -> Option<PathBuf> {
        if !is_plain_filename(filename) {
            return None;
        }
        Some(self.dir_for(date).join(filename))
    }
}

/// Random v4 UUID plus the original extension, lower-cased. Extensions that
/// are not plain ASCII alphanumerics are dropped so the name always passes
/// [`PathDeriver::file_path`].
pub fn generate_filename(original: &str) -> String {
    let id = uuid::Uuid::new_v4();
    match Path::new(original).extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            format!("{id}.{}", ext.to_ascii_lowercase())
        }
        _ => id.to_string(),
    }
}

fn is_plain_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}
